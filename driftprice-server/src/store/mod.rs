//! Persistence for recent-scrape records.
//!
//! Handlers only see [`ScrapeStore`] and [`CollectionStore`]. The production
//! implementation talks to Firestore over its REST API; [`MemoryStore`] backs
//! local runs and tests.
//! Concurrent writes to the same record are last-write-wins, inherited from
//! whichever store is in use.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::ScrapeRecord;

mod auth;
pub mod firestore;
pub mod memory;
pub mod value;

pub use firestore::FirestoreStore;
pub use memory::MemoryStore;

pub const RECENT_SCRAPES: &str = "recent-scrapes";
pub const RECENT_SCRAPES_LIMIT: usize = 50;
/// Field product collections are stamped with when scraped.
pub const SCRAPED_AT: &str = "scrapedAt";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record '{0}' not found")]
    NotFound(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("failed to reach Firestore: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Firestore returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("failed to decode Firestore response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ScrapeStore: Send + Sync {
    /// Merges `fields` into an existing record. Fails with
    /// [`StoreError::NotFound`] when the record does not exist.
    async fn update(&self, id: &str, fields: ScrapeRecord) -> Result<(), StoreError>;

    /// Creates or fully replaces the record stored under `id`.
    async fn put(&self, id: &str, record: ScrapeRecord) -> Result<(), StoreError>;

    /// Records carrying a `timestamp` field, newest first, each with its id
    /// under `"id"`.
    async fn list_recent(&self, limit: usize) -> Result<Vec<ScrapeRecord>, StoreError>;

    /// Deletes every record.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Size and freshness of one top-level collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionStats {
    pub total: u64,
    /// `scrapedAt` of the newest document carrying one.
    pub latest_scraped_at: Option<Value>,
}

/// Read and delete access to the scraped product collections.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Ids of every top-level collection.
    async fn collection_names(&self) -> Result<Vec<String>, StoreError>;

    /// An unknown collection has no documents.
    async fn collection_stats(&self, name: &str) -> Result<CollectionStats, StoreError>;

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError>;
}

/// Shapes a stored document the way clients see it: the document id first,
/// then the stored fields (a stored `id` field wins).
pub(crate) fn with_id(id: &str, fields: ScrapeRecord) -> ScrapeRecord {
    let mut record = ScrapeRecord::new();
    record.insert("id".to_string(), Value::String(id.to_string()));
    record.extend(fields);
    record
}
