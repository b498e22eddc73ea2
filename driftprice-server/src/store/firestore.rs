use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::auth::TokenSource;
use super::value::{decode_fields, decode_value, encode_fields, mask_path, nest_paths, update_paths, UpdatePath};
use super::{
    with_id, CollectionStats, CollectionStore, ScrapeStore, StoreError, RECENT_SCRAPES, SCRAPED_AT,
};
use crate::config::AdminCredentials;
use crate::types::ScrapeRecord;

const FIRESTORE_API: &str = "https://firestore.googleapis.com/v1";
const LIST_PAGE_SIZE: usize = 300;
// Firestore caps a single commit at 500 writes.
const COMMIT_BATCH: usize = 500;
const MAX_CONCURRENT_CALLS: usize = 32;

const DOC_ID: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Privileged Firestore client over the REST API.
///
/// Build it once at startup and share it through application state; the
/// cached access token and the concurrency limit are per instance.
#[derive(Clone)]
pub struct FirestoreStore {
    http_client: reqwest::Client,
    database_url: String,
    tokens: TokenSource,
    outbound_limit: Arc<Semaphore>,
}

#[derive(Deserialize)]
struct Document {
    name: String,
    #[serde(default)]
    fields: Option<Value>,
}

#[derive(Deserialize)]
struct QueryResult {
    #[serde(default)]
    document: Option<Document>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    documents: Vec<Document>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionIdsPage {
    #[serde(default)]
    collection_ids: Vec<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct AggregationResult {
    #[serde(default)]
    result: Option<Value>,
}

impl FirestoreStore {
    /// Connects with service-account credentials, or to the emulator when
    /// `emulator_host` is given.
    pub fn connect(
        credentials: &AdminCredentials,
        emulator_host: Option<&str>,
        http_client: reqwest::Client,
    ) -> Result<Self, StoreError> {
        let store = match emulator_host {
            Some(host) => {
                info!("Using Firestore emulator at {}", host);
                Self::with_endpoint(
                    &format!("http://{}/v1", host),
                    &credentials.project_id,
                    TokenSource::Emulator,
                    http_client,
                )
            }
            None => {
                let tokens = TokenSource::service_account(credentials, http_client.clone())?;
                Self::with_endpoint(FIRESTORE_API, &credentials.project_id, tokens, http_client)
            }
        };
        info!("Firestore client ready for project {}", credentials.project_id);
        Ok(store)
    }

    fn with_endpoint(
        api_url: &str,
        project_id: &str,
        tokens: TokenSource,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            http_client,
            database_url: format!(
                "{}/projects/{}/databases/(default)/documents",
                api_url.trim_end_matches('/'),
                project_id
            ),
            tokens,
            outbound_limit: Arc::new(Semaphore::new(MAX_CONCURRENT_CALLS)),
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.database_url, utf8_percent_encode(collection, DOC_ID))
    }

    fn document_url(&self, id: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(RECENT_SCRAPES),
            utf8_percent_encode(id, DOC_ID)
        )
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let token = self.tokens.bearer_token().await?;
        let _permit = self.outbound_limit.acquire().await.expect("semaphore closed");
        let resp = request.bearer_auth(token).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            message: error_message(&text),
        })
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, StoreError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn run_query(&self, body: &Value) -> Result<Vec<Document>, StoreError> {
        let request = self
            .http_client
            .post(format!("{}:runQuery", self.database_url))
            .json(body);
        let results: Vec<QueryResult> = self.send_json(request).await?;
        Ok(results.into_iter().filter_map(|r| r.document).collect())
    }

    async fn document_names(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("pageSize", LIST_PAGE_SIZE.to_string()),
                ("mask.fieldPaths", "__name__".to_string()),
            ];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }
            let page: ListPage = self
                .send_json(self.http_client.get(self.collection_url(collection)).query(&query))
                .await?;
            names.extend(page.documents.into_iter().map(|d| d.name));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => return Ok(names),
            }
        }
    }

    async fn delete_all(&self, collection: &str) -> Result<(), StoreError> {
        let names = self.document_names(collection).await?;
        info!("deleting {} documents from {}", names.len(), collection);
        for chunk in names.chunks(COMMIT_BATCH) {
            let writes: Vec<Value> = chunk.iter().map(|name| json!({ "delete": name })).collect();
            let request = self
                .http_client
                .post(format!("{}:commit", self.database_url))
                .json(&json!({ "writes": writes }));
            self.send(request).await?;
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let request = self
            .http_client
            .post(format!("{}:runAggregationQuery", self.database_url))
            .json(&count_query_body(collection));
        let results: Vec<AggregationResult> = self.send_json(request).await?;
        let count = results
            .iter()
            .find_map(|r| r.result.as_ref()?.pointer("/aggregateFields/count"))
            .ok_or_else(|| StoreError::Decode("aggregation returned no count".to_string()))?;
        decode_value(count)?
            .as_u64()
            .ok_or_else(|| StoreError::Decode(format!("bad count {}", count)))
    }
}

#[async_trait]
impl ScrapeStore for FirestoreStore {
    async fn update(&self, id: &str, fields: ScrapeRecord) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Err(StoreError::InvalidRecord("no fields to update".to_string()));
        }
        let paths = update_paths(&fields)?;
        debug!("updating {} with {} fields", id, paths.len());
        let request = self
            .http_client
            .patch(self.document_url(id))
            .query(&update_query(&paths))
            .json(&json!({ "fields": encode_fields(&nest_paths(&paths)) }));
        match self.send(request).await {
            Ok(_) => Ok(()),
            Err(StoreError::Status { status: 404, .. }) => Err(StoreError::NotFound(id.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, id: &str, record: ScrapeRecord) -> Result<(), StoreError> {
        if id.is_empty() {
            return Err(StoreError::InvalidRecord("empty document id".to_string()));
        }
        let request = self
            .http_client
            .patch(self.document_url(id))
            .json(&json!({ "fields": encode_fields(&record) }));
        self.send(request).await?;
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ScrapeRecord>, StoreError> {
        self.run_query(&latest_query_body(RECENT_SCRAPES, "timestamp", limit))
            .await?
            .into_iter()
            .map(|doc| {
                decode_fields(doc.fields.as_ref()).map(|fields| with_id(document_id(&doc.name), fields))
            })
            .collect()
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.delete_all(RECENT_SCRAPES).await
    }
}

#[async_trait]
impl CollectionStore for FirestoreStore {
    async fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut body = json!({ "pageSize": LIST_PAGE_SIZE });
            if let Some(token) = page_token.take() {
                body["pageToken"] = Value::String(token);
            }
            let request = self
                .http_client
                .post(format!("{}:listCollectionIds", self.database_url))
                .json(&body);
            let page: CollectionIdsPage = self.send_json(request).await?;
            names.extend(page.collection_ids);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => return Ok(names),
            }
        }
    }

    async fn collection_stats(&self, name: &str) -> Result<CollectionStats, StoreError> {
        let total = self.count(name).await?;
        let latest = self
            .run_query(&latest_query_body(name, SCRAPED_AT, 1))
            .await?
            .into_iter()
            .next()
            .map(|doc| decode_fields(doc.fields.as_ref()))
            .transpose()?;
        Ok(CollectionStats {
            total,
            latest_scraped_at: latest.and_then(|mut fields| fields.remove(SCRAPED_AT)),
        })
    }

    async fn delete_collection(&self, name: &str) -> Result<(), StoreError> {
        self.delete_all(name).await
    }
}

/// Query parameters for a merge-update: one mask entry per field path, plus
/// an existence precondition so missing records are not created.
fn update_query(paths: &[UpdatePath<'_>]) -> Vec<(&'static str, String)> {
    let mut query: Vec<(&'static str, String)> = paths
        .iter()
        .map(|(segments, _)| ("updateMask.fieldPaths", mask_path(segments)))
        .collect();
    query.push(("currentDocument.exists", "true".to_string()));
    query
}

/// Newest-first query on `field`. Documents without the field are skipped by
/// Firestore's ordering.
fn latest_query_body(collection: &str, field: &str, limit: usize) -> Value {
    json!({
        "structuredQuery": {
            "from": [{ "collectionId": collection }],
            "orderBy": [{ "field": { "fieldPath": field }, "direction": "DESCENDING" }],
            "limit": limit
        }
    })
}

fn count_query_body(collection: &str) -> Value {
    json!({
        "structuredAggregationQuery": {
            "structuredQuery": { "from": [{ "collectionId": collection }] },
            "aggregations": [{ "alias": "count", "count": {} }]
        }
    })
}

fn document_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;
    use axum::extract::{RawQuery, State};
    use axum::http::{Method, StatusCode, Uri};
    use axum::{Json, Router};
    use std::sync::Mutex;

    const DOCS: &str = "/v1/projects/driftprice-test/databases/(default)/documents";

    #[derive(Clone, Debug)]
    struct Call {
        method: Method,
        path: String,
        query: Option<String>,
        body: Value,
    }

    type Reply = fn(&Call) -> (StatusCode, Value);

    #[derive(Clone)]
    struct Mock {
        calls: Arc<Mutex<Vec<Call>>>,
        reply: Reply,
    }

    async fn mock_firestore(
        State(mock): State<Mock>,
        method: Method,
        uri: Uri,
        RawQuery(query): RawQuery,
        body: Bytes,
    ) -> (StatusCode, Json<Value>) {
        let call = Call {
            method,
            path: uri.path().to_string(),
            query,
            body: serde_json::from_slice(&body).unwrap_or(Value::Null),
        };
        let (status, reply) = (mock.reply)(&call);
        mock.calls.lock().unwrap().push(call);
        (status, Json(reply))
    }

    /// Serves every request through `reply`, recording each call.
    async fn spawn_mock(reply: Reply) -> (FirestoreStore, Arc<Mutex<Vec<Call>>>) {
        let calls: Arc<Mutex<Vec<Call>>> = Arc::default();
        let app = Router::new().fallback(mock_firestore).with_state(Mock {
            calls: calls.clone(),
            reply,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (emulator_store(&addr.to_string()), calls)
    }

    fn emulator_store(host: &str) -> FirestoreStore {
        let creds = AdminCredentials {
            project_id: "driftprice-test".into(),
            client_email: "svc@driftprice-test.iam.gserviceaccount.com".into(),
            private_key: String::new(),
        };
        FirestoreStore::connect(&creds, Some(host), reqwest::Client::new()).unwrap()
    }

    fn record(value: Value) -> ScrapeRecord {
        value.as_object().cloned().unwrap()
    }

    fn accept_patch(call: &Call) -> (StatusCode, Value) {
        if call.path.ends_with("/ghost") {
            return (
                StatusCode::NOT_FOUND,
                json!({"error": {"code": 404, "message": "No document to update", "status": "NOT_FOUND"}}),
            );
        }
        (StatusCode::OK, json!({"name": call.path, "fields": call.body["fields"]}))
    }

    fn names(collection: &str, range: std::ops::Range<usize>) -> Value {
        let docs: Vec<Value> = range
            .map(|i| {
                json!({"name": format!("projects/driftprice-test/databases/(default)/documents/{collection}/d{i}")})
            })
            .collect();
        Value::Array(docs)
    }

    #[tokio::test]
    async fn test_update_sends_mask_and_precondition() {
        let (store, calls) = spawn_mock(accept_patch).await;

        store
            .update("scrape 1", record(json!({"status": "done", "item count": 3})))
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        let call = &calls[0];
        assert_eq!(call.method, Method::PATCH);
        assert_eq!(call.path, format!("{DOCS}/recent-scrapes/scrape%201"));
        let query = call.query.as_deref().unwrap();
        assert!(query.contains("updateMask.fieldPaths=status"));
        assert!(query.contains("updateMask.fieldPaths=%60item+count%60"));
        assert!(query.contains("currentDocument.exists=true"));
        assert_eq!(call.body["fields"]["status"], json!({"stringValue": "done"}));
        assert_eq!(call.body["fields"]["item count"], json!({"integerValue": "3"}));
    }

    #[tokio::test]
    async fn test_update_dotted_key_targets_nested_field() {
        let (store, calls) = spawn_mock(accept_patch).await;

        store.update("s1", record(json!({"stats.total": 5}))).await.unwrap();

        let calls = calls.lock().unwrap();
        let query = calls[0].query.as_deref().unwrap();
        assert!(query.contains("updateMask.fieldPaths=stats.total"));
        assert!(!query.contains("%60"));
        assert_eq!(
            calls[0].body,
            json!({"fields": {"stats": {"mapValue": {"fields": {"total": {"integerValue": "5"}}}}}})
        );
    }

    #[tokio::test]
    async fn test_update_missing_document_is_not_found() {
        let (store, _calls) = spawn_mock(accept_patch).await;
        let err = store
            .update("ghost", record(json!({"status": "done"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_update_rejects_empty_fields() {
        let store = emulator_store("127.0.0.1:9");
        let err = store.update("a", ScrapeRecord::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn test_put_replaces_without_mask() {
        let (store, calls) = spawn_mock(accept_patch).await;
        store.put("abc", record(json!({"timestamp": 1}))).await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].query, None);
        assert_eq!(calls[0].body, json!({"fields": {"timestamp": {"integerValue": "1"}}}));
    }

    #[tokio::test]
    async fn test_list_recent_decodes_documents_and_skips_empty_results() {
        let (store, calls) = spawn_mock(|_| {
            (
                StatusCode::OK,
                json!([
                    {
                        "document": {
                            "name": "projects/driftprice-test/databases/(default)/documents/recent-scrapes/zara-2",
                            "fields": {
                                "url": {"stringValue": "https://zara.com"},
                                "timestamp": {"integerValue": "200"}
                            }
                        },
                        "readTime": "2024-03-09T14:05:07.123Z"
                    },
                    {
                        "document": {
                            "name": "projects/driftprice-test/databases/(default)/documents/recent-scrapes/hm-1",
                            "fields": {"timestamp": {"integerValue": "100"}}
                        }
                    },
                    {"readTime": "2024-03-09T14:05:07.123Z"}
                ]),
            )
        })
        .await;

        let scrapes = store.list_recent(50).await.unwrap();

        assert_eq!(
            scrapes,
            vec![
                record(json!({"id": "zara-2", "url": "https://zara.com", "timestamp": 200})),
                record(json!({"id": "hm-1", "timestamp": 100})),
            ]
        );
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].path, format!("{DOCS}:runQuery"));
        assert_eq!(calls[0].body["structuredQuery"]["limit"], 50);
        assert_eq!(
            calls[0].body["structuredQuery"]["orderBy"][0],
            json!({"field": {"fieldPath": "timestamp"}, "direction": "DESCENDING"})
        );
    }

    #[tokio::test]
    async fn test_clear_pages_names_and_commits_in_batches() {
        let (store, calls) = spawn_mock(|call| {
            if call.path.ends_with(":commit") {
                return (StatusCode::OK, json!({"writeResults": []}));
            }
            match call.query.as_deref() {
                Some(q) if q.contains("pageToken=page-2") => {
                    (StatusCode::OK, json!({"documents": names("recent-scrapes", 400..600)}))
                }
                _ => (
                    StatusCode::OK,
                    json!({"documents": names("recent-scrapes", 0..400), "nextPageToken": "page-2"}),
                ),
            }
        })
        .await;

        store.clear().await.unwrap();

        let calls = calls.lock().unwrap();
        let listed: Vec<&Call> = calls.iter().filter(|c| c.method == Method::GET).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|c| c.path == format!("{DOCS}/recent-scrapes")));

        let commits: Vec<&Call> = calls.iter().filter(|c| c.path.ends_with(":commit")).collect();
        let sizes: Vec<usize> = commits
            .iter()
            .map(|c| c.body["writes"].as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![500, 100]);
        assert_eq!(
            commits[1].body["writes"][99]["delete"],
            "projects/driftprice-test/databases/(default)/documents/recent-scrapes/d599"
        );
    }

    #[tokio::test]
    async fn test_clear_empty_collection_commits_nothing() {
        let (store, calls) = spawn_mock(|_| (StatusCode::OK, json!({}))).await;
        store.clear().await.unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_collection_names_follow_pages() {
        let (store, calls) = spawn_mock(|call| match call.body.get("pageToken") {
            Some(_) => (StatusCode::OK, json!({"collectionIds": ["zara_products"]})),
            None => (
                StatusCode::OK,
                json!({"collectionIds": ["hm_products", "recent-scrapes"], "nextPageToken": "t2"}),
            ),
        })
        .await;

        let names = store.collection_names().await.unwrap();

        assert_eq!(names, vec!["hm_products", "recent-scrapes", "zara_products"]);
        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].path, format!("{DOCS}:listCollectionIds"));
        assert_eq!(calls[1].body["pageToken"], "t2");
    }

    #[tokio::test]
    async fn test_collection_stats_counts_and_reads_latest() {
        let (store, calls) = spawn_mock(|call| {
            if call.path.ends_with(":runAggregationQuery") {
                return (
                    StatusCode::OK,
                    json!([{"result": {"aggregateFields": {"count": {"integerValue": "42"}}}, "readTime": "x"}]),
                );
            }
            (
                StatusCode::OK,
                json!([{"document": {
                    "name": "projects/driftprice-test/databases/(default)/documents/zara_products/p9",
                    "fields": {"scrapedAt": {"stringValue": "2024-03-10T08:30:00Z"}, "price": {"doubleValue": 19.99}}
                }}]),
            )
        })
        .await;

        let stats = store.collection_stats("zara_products").await.unwrap();

        assert_eq!(
            stats,
            CollectionStats {
                total: 42,
                latest_scraped_at: Some(json!("2024-03-10T08:30:00Z")),
            }
        );
        let calls = calls.lock().unwrap();
        assert_eq!(
            calls[0].body["structuredAggregationQuery"]["structuredQuery"]["from"][0]["collectionId"],
            "zara_products"
        );
        assert_eq!(calls[1].body["structuredQuery"]["orderBy"][0]["field"]["fieldPath"], "scrapedAt");
        assert_eq!(calls[1].body["structuredQuery"]["limit"], 1);
    }

    #[tokio::test]
    async fn test_collection_stats_empty_collection() {
        let (store, _calls) = spawn_mock(|call| {
            if call.path.ends_with(":runAggregationQuery") {
                return (
                    StatusCode::OK,
                    json!([{"result": {"aggregateFields": {"count": {"integerValue": "0"}}}}]),
                );
            }
            (StatusCode::OK, json!([{"readTime": "x"}]))
        })
        .await;
        assert_eq!(
            store.collection_stats("empty").await.unwrap(),
            CollectionStats::default()
        );
    }

    #[tokio::test]
    async fn test_delete_collection_targets_named_collection() {
        let (store, calls) = spawn_mock(|call| {
            if call.path.ends_with(":commit") {
                return (StatusCode::OK, json!({}));
            }
            (StatusCode::OK, json!({"documents": names("hm_products", 0..3)}))
        })
        .await;

        store.delete_collection("hm_products").await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].path, format!("{DOCS}/hm_products"));
        assert_eq!(calls[1].body["writes"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_status_errors_carry_firestore_message() {
        let (store, _calls) = spawn_mock(|_| {
            (
                StatusCode::TOO_MANY_REQUESTS,
                json!({"error": {"code": 429, "message": "Quota exceeded"}}),
            )
        })
        .await;
        let err = store.list_recent(50).await.unwrap_err();
        assert!(
            matches!(err, StoreError::Status { status: 429, ref message } if message == "Quota exceeded")
        );
    }

    #[test]
    fn test_urls_and_names() {
        let store = FirestoreStore::with_endpoint(
            FIRESTORE_API,
            "proj",
            TokenSource::Emulator,
            reqwest::Client::new(),
        );
        assert_eq!(
            store.document_url("a/b c"),
            "https://firestore.googleapis.com/v1/projects/proj/databases/(default)/documents/recent-scrapes/a%2Fb%20c"
        );
        assert_eq!(
            store.collection_url("Dashboard Inputs"),
            "https://firestore.googleapis.com/v1/projects/proj/databases/(default)/documents/Dashboard%20Inputs"
        );
        assert_eq!(
            document_id("projects/proj/databases/(default)/documents/recent-scrapes/xyz"),
            "xyz"
        );
    }

    #[test]
    fn test_error_message_prefers_structured_body() {
        assert_eq!(
            error_message(r#"{"error":{"code":403,"message":"Missing permissions"}}"#),
            "Missing permissions"
        );
        assert_eq!(error_message("gateway timeout"), "gateway timeout");
    }
}
