use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::SearchRequest;

#[derive(Debug, Error)]
pub enum SearchError {
    /// The search service reported a failure with a message.
    #[error("{0}")]
    Failed(String),

    #[error("Failed to send request to search service: {0}")]
    Transport(#[from] reqwest::Error),

    /// The search service failed without saying why.
    #[error("Unknown error")]
    Unknown,
}

impl SearchError {
    /// Message safe to hand back to the dashboard.
    pub fn client_message(&self) -> String {
        match self {
            SearchError::Failed(message) => message.clone(),
            SearchError::Transport(e) => e.to_string(),
            SearchError::Unknown => "Unknown error".to_string(),
        }
    }
}

/// The product search function the `/api/search` route proxies to.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn perform_search(&self, request: &SearchRequest) -> Result<Value, SearchError>;
}

/// Forwards searches to the search service over HTTP.
#[derive(Clone, Debug)]
pub struct HttpSearchBackend {
    search_url: String,
    http_client: reqwest::Client,
}

impl HttpSearchBackend {
    pub fn new(service_url: &str, http_client: reqwest::Client) -> Self {
        Self {
            search_url: format!("{}/search", service_url.trim_end_matches('/')),
            http_client,
        }
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    async fn perform_search(&self, request: &SearchRequest) -> Result<Value, SearchError> {
        info!(
            "Searching for: {} (image search: {})",
            request.query().unwrap_or(&serde_json::Value::Null),
            request.image_search()
        );
        debug!("Search URL: {}", self.search_url);

        let resp = self
            .http_client
            .post(&self.search_url)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json::<Value>().await?);
        }

        let text = resp.text().await.unwrap_or_default();
        debug!("search service returned {}: {}", status, text);
        Err(failure_from_body(&text))
    }
}

/// Picks the most specific message out of a failed search response: a JSON
/// `error` string, else the raw body, else nothing.
fn failure_from_body(body: &str) -> SearchError {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        return match obj.get("error").and_then(Value::as_str) {
            Some(message) if !message.is_empty() => SearchError::Failed(message.to_string()),
            _ => SearchError::Unknown,
        };
    }
    let body = body.trim();
    if body.is_empty() {
        SearchError::Unknown
    } else {
        SearchError::Failed(body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    async fn spawn_search_service(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_forwards_request_and_returns_body_unmodified() {
        let app = Router::new().route(
            "/search",
            post(|Json(body): Json<Value>| async move {
                Json(json!({"success": true, "echo": body, "results": [{"id": "p1", "score": 0.82}]}))
            }),
        );
        let url = spawn_search_service(app).await;
        let backend = HttpSearchBackend::new(&url, reqwest::Client::new());

        let body = json!({
            "query": "black denim jacket",
            "analyzedDescription": {"color": "black", "type": "jacket"},
            "page": 2
        });
        let request: SearchRequest = serde_json::from_value(body).unwrap();
        let result = backend.perform_search(&request).await.unwrap();

        assert_eq!(
            result["echo"],
            json!({"query": "black denim jacket", "analyzedDescription": {"color": "black", "type": "jacket"}})
        );
        assert_eq!(result["results"][0]["id"], "p1");
    }

    #[tokio::test]
    async fn test_error_status_carries_service_message() {
        let app = Router::new().route(
            "/search",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"success": false, "error": "Search query is required for text search"})),
                )
            }),
        );
        let url = spawn_search_service(app).await;
        let backend = HttpSearchBackend::new(&url, reqwest::Client::new());

        let err = backend.perform_search(&SearchRequest::default()).await.unwrap_err();
        assert_eq!(err.client_message(), "Search query is required for text search");
    }

    #[test]
    fn test_failure_from_body() {
        assert!(matches!(failure_from_body(""), SearchError::Unknown));
        assert!(matches!(failure_from_body("{}"), SearchError::Unknown));
        assert!(matches!(failure_from_body(r#"{"error": 3}"#), SearchError::Unknown));
        assert_eq!(failure_from_body("upstream timeout").client_message(), "upstream timeout");
        assert_eq!(failure_from_body(r#"{"error":"boom"}"#).client_message(), "boom");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transport_error() {
        let backend = HttpSearchBackend::new("http://127.0.0.1:9", reqwest::Client::new());
        let err = backend.perform_search(&SearchRequest::default()).await.unwrap_err();
        assert!(matches!(err, SearchError::Transport(_)));
    }
}
