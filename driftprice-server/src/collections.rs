//! Product collection summaries for the dashboard's collection browser.
//!
//! Summaries are cached per collection for [`CACHE_TTL`]. The last good
//! summary is also kept past its expiry and served when a fresh read fails.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::store::{CollectionStats, CollectionStore, StoreError, RECENT_SCRAPES};

pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const CACHE_CONTROL: &str = "public, s-maxage=300, stale-while-revalidate=600";

/// Collections that hold dashboard state rather than scraped products.
pub const HIDDEN_COLLECTIONS: [&str; 3] = ["products", "Dashboard Inputs", RECENT_SCRAPES];

const MAX_CACHED_COLLECTIONS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDetails {
    pub name: String,
    pub total_products: u64,
    /// Milliseconds since the Unix epoch.
    pub last_updated: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub cached_collections: u64,
    #[serde(rename = "cacheTTL")]
    pub cache_ttl: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionsResponse {
    pub collections: Vec<String>,
    pub details: Vec<CollectionDetails>,
    pub cache_info: CacheInfo,
}

#[derive(Clone)]
pub struct CollectionCache {
    fresh: Cache<String, CollectionDetails>,
    last_known: Cache<String, CollectionDetails>,
}

impl CollectionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            fresh: Cache::builder()
                .max_capacity(MAX_CACHED_COLLECTIONS)
                .time_to_live(ttl)
                .build(),
            last_known: Cache::builder().max_capacity(MAX_CACHED_COLLECTIONS).build(),
        }
    }

    /// Cached summary of `name`, refreshed from the store once expired. A
    /// failed refresh falls back to the last good summary, then to an empty
    /// one.
    pub async fn details(&self, store: &dyn CollectionStore, name: &str) -> CollectionDetails {
        if let Some(cached) = self.fresh.get(name).await {
            debug!("Using cached data for {}", name);
            return cached;
        }

        debug!("Fetching fresh data for {}", name);
        let now = now_millis();
        match store.collection_stats(name).await {
            Ok(stats) => {
                let details = CollectionDetails {
                    name: name.to_string(),
                    total_products: stats.total,
                    last_updated: stats
                        .latest_scraped_at
                        .as_ref()
                        .and_then(scraped_at_millis)
                        .unwrap_or(now),
                };
                self.fresh.insert(name.to_string(), details.clone()).await;
                self.last_known.insert(name.to_string(), details.clone()).await;
                details
            }
            Err(e) => {
                warn!("Error fetching details for {}: {}", name, e);
                match self.last_known.get(name).await {
                    Some(stale) => {
                        debug!("Using expired cache for {} due to error", name);
                        stale
                    }
                    None => CollectionDetails {
                        name: name.to_string(),
                        total_products: 0,
                        last_updated: now,
                    },
                }
            }
        }
    }

    pub async fn invalidate(&self, name: &str) {
        self.fresh.invalidate(name).await;
        self.last_known.invalidate(name).await;
    }

    /// Number of unexpired summaries.
    pub async fn cached_count(&self) -> u64 {
        self.fresh.run_pending_tasks().await;
        self.fresh.entry_count()
    }
}

/// Every visible collection with its (cached) summary.
pub async fn summarize(
    store: &dyn CollectionStore,
    cache: &CollectionCache,
) -> Result<CollectionsResponse, StoreError> {
    let names: Vec<String> = store
        .collection_names()
        .await?
        .into_iter()
        .filter(|name| !HIDDEN_COLLECTIONS.contains(&name.as_str()))
        .collect();

    let details = join_all(names.iter().map(|name| cache.details(store, name))).await;

    Ok(CollectionsResponse {
        collections: names,
        details,
        cache_info: CacheInfo {
            cached_collections: cache.cached_count().await,
            cache_ttl: CACHE_TTL.as_millis() as u64,
        },
    })
}

/// Uncached summary of one collection. An empty collection reports the
/// current time; documents without a readable `scrapedAt` count as epoch.
pub async fn describe(store: &dyn CollectionStore, name: &str) -> Result<CollectionDetails, StoreError> {
    let CollectionStats {
        total,
        latest_scraped_at,
    } = store.collection_stats(name).await?;
    let last_updated = if total == 0 {
        now_millis()
    } else {
        latest_scraped_at.as_ref().and_then(scraped_at_millis).unwrap_or(0)
    };
    Ok(CollectionDetails {
        name: name.to_string(),
        total_products: total,
        last_updated,
    })
}

/// `scrapedAt` as epoch milliseconds: a number is taken as-is, a string must
/// be RFC 3339.
pub fn scraped_at_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|at| at.timestamp_millis()),
        _ => None,
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
