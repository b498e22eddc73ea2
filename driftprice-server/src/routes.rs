use std::io;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, Uri},
    response::{IntoResponse, Json},
    routing::{get, patch, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use url::Url;

use crate::api_url::{api_base_url, api_url, ExecutionContext};
use crate::collections::{self, CollectionDetails, CACHE_CONTROL};
use crate::config::PublicFirebaseConfig;
use crate::error::{
    ApiError, FailureKind, ADD_SCRAPE_FAILED, CLEAR_SCRAPES_FAILED, FETCH_COLLECTIONS_FAILED,
    FETCH_COLLECTION_FAILED, FETCH_SCRAPES_FAILED, UPDATE_SCRAPE_FAILED,
};
use crate::logger::Logger;
use crate::store::RECENT_SCRAPES_LIMIT;
use crate::types::*;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/api/search", post(search_handler))
        .route(
            "/api/recent-scrapes",
            get(list_scrapes_handler)
                .post(add_scrape_handler)
                .delete(clear_scrapes_handler),
        )
        .route("/api/recent-scrapes/:id", patch(update_scrape_handler))
        .route(
            "/api/collections",
            get(list_collections_handler).delete(delete_collection_handler),
        )
        .route("/api/collections/:name", get(collection_details_handler))
        .route("/api/firebase-config", get(firebase_config_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Json<HealthResponse> {
    let request_url = request_url(&headers, &uri);
    let context = match request_url.as_ref() {
        Some(url) => ExecutionContext::ServerRequest { url },
        None => ExecutionContext::Detached,
    };
    let base = api_base_url(&context, &state.url_env);
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        search_url: api_url(&base, "search"),
        api_base_url: base,
    })
}

/// Reconstructs the absolute URL the client used, honouring a reverse proxy's
/// `X-Forwarded-Proto`.
fn request_url(headers: &HeaderMap, uri: &Uri) -> Option<Url> {
    let host = headers.get("host")?.to_str().ok()?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Url::parse(&format!("{}://{}{}", scheme, host, path)).ok()
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    info!("Search API called");
    let mut log = RequestLog::open(&state, "search");

    let request: SearchRequest = serde_json::from_slice(&body).map_err(|e| {
        log.record(|l| l.error("malformed search request", Some(&e)));
        ApiError::Search(e.into())
    })?;
    log.record(|l| {
        let logged = serde_json::to_value(&request).unwrap_or(Value::Null);
        l.log("search request", Some(&logged))
    });

    let outcome = state.search.perform_search(&request).await;
    match outcome {
        Ok(results) => {
            log.record(|l| l.log("search completed", Some(&results)));
            log.finish();
            Ok(Json(results))
        }
        Err(e) => {
            log.record(|l| {
                l.error_data(
                    "search failed",
                    &json!({ "error": e.client_message(), "request": request.fields() }),
                )
            });
            log.finish();
            Err(ApiError::Search(e.into()))
        }
    }
}

async fn update_scrape_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let fail = ApiError::opaque(UPDATE_SCRAPE_FAILED);
    let fields: ScrapeRecord = match serde_json::from_slice(&body) {
        Ok(fields) => fields,
        Err(e) => return Err(fail(e.into())),
    };
    match state.store.update(&id, fields).await {
        Ok(()) => Ok(Json(SuccessResponse::ok())),
        Err(e) => Err(fail(e.into())),
    }
}

async fn list_scrapes_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ScrapesResponse>, ApiError> {
    let scrapes = state
        .store
        .list_recent(RECENT_SCRAPES_LIMIT)
        .await
        .map_err(FailureKind::from)
        .map_err(ApiError::opaque(FETCH_SCRAPES_FAILED))?;
    Ok(Json(ScrapesResponse { scrapes }))
}

async fn add_scrape_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SuccessResponse>, ApiError> {
    let fail = ApiError::opaque(ADD_SCRAPE_FAILED);
    let record: ScrapeRecord = match serde_json::from_slice(&body) {
        Ok(record) => record,
        Err(e) => return Err(fail(e.into())),
    };
    let id = record_id(&record);
    match state.store.put(&id, record).await {
        Ok(()) => Ok(Json(SuccessResponse::ok())),
        Err(e) => Err(fail(e.into())),
    }
}

async fn clear_scrapes_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state
        .store
        .clear()
        .await
        .map_err(FailureKind::from)
        .map_err(ApiError::opaque(CLEAR_SCRAPES_FAILED))?;
    Ok(Json(SuccessResponse::ok()))
}

async fn list_collections_handler(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let summary = collections::summarize(state.collections.as_ref(), &state.collection_cache)
        .await
        .map_err(FailureKind::from)
        .map_err(ApiError::detailed(FETCH_COLLECTIONS_FAILED))?;
    Ok(([(header::CACHE_CONTROL, CACHE_CONTROL)], Json(summary)))
}

async fn delete_collection_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<DeleteCollectionResponse>, ApiError> {
    let name = serde_json::from_slice::<Value>(&body)
        .map_err(FailureKind::from)
        .and_then(|body| collection_name(&body))
        .map_err(ApiError::deletion)?;

    state
        .collections
        .delete_collection(&name)
        .await
        .map_err(|e| ApiError::deletion(e.into()))?;
    state.collection_cache.invalidate(&name).await;
    info!("Deleted collection {}", name);

    Ok(Json(DeleteCollectionResponse {
        message: format!("Successfully deleted collection {}", name),
        status: "success".to_string(),
    }))
}

async fn collection_details_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<CollectionDetails>, ApiError> {
    let details = collections::describe(state.collections.as_ref(), &name)
        .await
        .map_err(FailureKind::from)
        .map_err(ApiError::opaque(FETCH_COLLECTION_FAILED))?;
    Ok(Json(details))
}

/// The `collectionName` of a delete request. Absent, null, empty, `false`
/// and `0` all count as missing.
fn collection_name(body: &Value) -> Result<String, FailureKind> {
    const FIELD: &str = "collectionName";
    match body.get(FIELD) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Err(FailureKind::MissingField(FIELD)),
        Some(Value::String(name)) if name.is_empty() => Err(FailureKind::MissingField(FIELD)),
        Some(Value::Number(n)) if n.as_f64() == Some(0.0) => Err(FailureKind::MissingField(FIELD)),
        Some(other) => serde_json::from_value(other.clone()).map_err(FailureKind::from),
    }
}

async fn firebase_config_handler(
    State(state): State<Arc<AppState>>,
) -> Json<PublicFirebaseConfig> {
    Json(state.public_firebase.clone())
}

/// The record's own `id` field (string or number), or a fresh UUID. The
/// record itself is stored as sent.
fn record_id(record: &ScrapeRecord) -> String {
    match record.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

/// Optional per-request log file. Failures to write it are reported on the
/// console and never fail the request.
struct RequestLog(Option<Logger>);

impl RequestLog {
    fn open(state: &AppState, prefix: &str) -> Self {
        if !state.request_logs {
            return Self(None);
        }
        match Logger::new(&state.log_dir, prefix) {
            Ok(logger) => Self(Some(logger)),
            Err(e) => {
                warn!("Failed to open request log in {}: {}", state.log_dir.display(), e);
                Self(None)
            }
        }
    }

    fn record(&mut self, write: impl FnOnce(&mut Logger) -> io::Result<()>) {
        if let Some(logger) = self.0.as_mut() {
            if let Err(e) = write(logger) {
                warn!("Failed to write request log {}: {}", logger.path().display(), e);
            }
        }
    }

    fn finish(self) {
        if let Some(logger) = self.0 {
            let path = logger.path().to_path_buf();
            if let Err(e) = logger.close() {
                warn!("Failed to close request log {}: {}", path.display(), e);
            }
        }
    }
}
