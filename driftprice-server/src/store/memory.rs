use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::value::{insert_path, update_paths};
use super::{
    with_id, CollectionStats, CollectionStore, ScrapeStore, StoreError, RECENT_SCRAPES, SCRAPED_AT,
};
use crate::types::ScrapeRecord;

type Collection = HashMap<String, ScrapeRecord>;

/// Process-local store with the same merge and ordering rules as Firestore.
/// Holds every top-level collection; recent scrapes live under
/// [`RECENT_SCRAPES`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<ScrapeRecord> {
        self.collections
            .read()
            .await
            .get(RECENT_SCRAPES)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Creates or replaces one document in any collection.
    pub async fn insert(&self, collection: &str, id: &str, record: ScrapeRecord) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::InvalidRecord("empty document id".to_string()));
        }
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record);
        Ok(())
    }
}

#[async_trait]
impl ScrapeStore for MemoryStore {
    async fn update(&self, id: &str, fields: ScrapeRecord) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Err(StoreError::InvalidRecord("no fields to update".to_string()));
        }
        let mut collections = self.collections.write().await;
        let record = collections
            .get_mut(RECENT_SCRAPES)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let paths = update_paths(&fields)?;
        debug!("merging {} fields into {}", paths.len(), id);
        for (segments, value) in paths {
            insert_path(record, &segments, value.clone());
        }
        Ok(())
    }

    async fn put(&self, id: &str, record: ScrapeRecord) -> Result<(), StoreError> {
        self.insert(RECENT_SCRAPES, id, record).await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ScrapeRecord>, StoreError> {
        let collections = self.collections.read().await;
        let Some(records) = collections.get(RECENT_SCRAPES) else {
            return Ok(Vec::new());
        };
        let mut stamped: Vec<(&String, &ScrapeRecord)> = records
            .iter()
            .filter(|(_, record)| record.contains_key("timestamp"))
            .collect();
        stamped.sort_by(|(a_id, a), (b_id, b)| {
            compare_values(&b["timestamp"], &a["timestamp"]).then_with(|| b_id.cmp(a_id))
        });
        Ok(stamped
            .into_iter()
            .take(limit)
            .map(|(id, record)| with_id(id, record.clone()))
            .collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.delete_collection(RECENT_SCRAPES).await
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        let collections = self.collections.read().await;
        let mut names: Vec<String> = collections
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats, StoreError> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(name) else {
            return Ok(CollectionStats::default());
        };
        Ok(CollectionStats {
            total: docs.len() as u64,
            latest_scraped_at: docs
                .values()
                .filter_map(|doc| doc.get(SCRAPED_AT))
                .max_by(|a, b| compare_values(a, b))
                .cloned(),
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
        self.collections.write().await.remove(name);
        Ok(())
    }
}

/// Firestore's cross-type ordering: null < bool < number < string < array < map.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(a, b)| compare_values(a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}
