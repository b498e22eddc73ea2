pub mod api_url;
pub mod collections;
pub mod config;
pub mod error;
pub mod logger;
pub mod routes;
pub mod search;
pub mod store;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use collections::{CollectionCache, CACHE_TTL};
use config::{Config, PublicFirebaseConfig, StoreKind};
use search::{HttpSearchBackend, SearchBackend};
use store::{CollectionStore, FirestoreStore, MemoryStore, ScrapeStore, StoreError};

pub use api_url::UrlEnv;
pub use types::*;

/// Shared state handed to every route.
///
/// Built exactly once at startup by [`AppState::from_config`]; the store and
/// search backend inside are the process's only instances.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ScrapeStore>,
    pub collections: Arc<dyn CollectionStore>,
    pub collection_cache: CollectionCache,
    pub search: Arc<dyn SearchBackend>,
    pub log_dir: PathBuf,
    pub request_logs: bool,
    pub public_firebase: PublicFirebaseConfig,
    pub url_env: UrlEnv,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Arc<dyn ScrapeStore>,
        collections: Arc<dyn CollectionStore>,
        search: Arc<dyn SearchBackend>,
    ) -> Self {
        Self {
            store,
            collections,
            collection_cache: CollectionCache::new(CACHE_TTL),
            search,
            log_dir: config.log_dir.clone(),
            request_logs: config.request_logs,
            public_firebase: config.public_firebase.clone(),
            url_env: config.url_env.clone(),
        }
    }

    pub fn from_config(config: &Config, http_client: reqwest::Client) -> Result<Self, StoreError> {
        let (store, collections): (Arc<dyn ScrapeStore>, Arc<dyn CollectionStore>) =
            match (config.store, config.admin.as_ref()) {
                (StoreKind::Firestore, Some(credentials)) => {
                    let firestore = Arc::new(FirestoreStore::connect(
                        credentials,
                        config.firestore_emulator_host.as_deref(),
                        http_client.clone(),
                    )?);
                    (firestore.clone() as Arc<dyn ScrapeStore>, firestore as Arc<dyn CollectionStore>)
                }
                (StoreKind::Firestore, None) => {
                    return Err(StoreError::Auth(
                        "Firestore store selected without admin credentials".to_string(),
                    ))
                }
                (StoreKind::Memory, _) => {
                    let memory = Arc::new(MemoryStore::new());
                    (memory.clone() as Arc<dyn ScrapeStore>, memory as Arc<dyn CollectionStore>)
                }
            };
        let search = Arc::new(HttpSearchBackend::new(&config.search_service_url, http_client));
        Ok(Self::new(config, store, collections, search))
    }
}
