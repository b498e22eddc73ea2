use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A recent-scrape document: free-form fields, no schema enforced here.
pub type ScrapeRecord = Map<String, Value>;

/// Body keys the search proxy forwards.
pub const SEARCH_FIELDS: [&str; 3] = ["query", "analyzedDescription", "imageSearch"];

/// A search request as the dashboard sent it. Only the keys in
/// [`SEARCH_FIELDS`] are kept, with their values untouched: checking them is
/// the search service's job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct SearchRequest {
    fields: Map<String, Value>,
}

impl SearchRequest {
    pub fn query(&self) -> Option<&Value> {
        self.fields.get("query")
    }

    pub fn image_search(&self) -> bool {
        self.fields
            .get("imageSearch")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl From<Map<String, Value>> for SearchRequest {
    fn from(mut body: Map<String, Value>) -> Self {
        body.retain(|key, _| SEARCH_FIELDS.contains(&key.as_str()));
        Self { fields: body }
    }
}

impl From<SearchRequest> for Map<String, Value> {
    fn from(request: SearchRequest) -> Self {
        request.fields
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetailedErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchFailureResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScrapesResponse {
    pub scrapes: Vec<ScrapeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub api_base_url: String,
    pub search_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteCollectionResponse {
    pub message: String,
    pub status: String,
}
