//! Route-boundary errors.
//!
//! Handlers return [`ApiError`], which keeps the typed failure for the server
//! log while the dashboard only ever sees the route's fixed message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::error;

use crate::search::SearchError;
use crate::store::StoreError;
use crate::types::{DetailedErrorResponse, ErrorResponse, SearchFailureResponse};

pub const UPDATE_SCRAPE_FAILED: &str = "Failed to update scrape";
pub const FETCH_SCRAPES_FAILED: &str = "Failed to fetch recent scrapes";
pub const ADD_SCRAPE_FAILED: &str = "Failed to add recent scrape";
pub const CLEAR_SCRAPES_FAILED: &str = "Failed to clear recent scrapes";
pub const FETCH_COLLECTIONS_FAILED: &str = "Failed to fetch collections";
pub const FETCH_COLLECTION_FAILED: &str = "Failed to fetch collection details";
pub const DELETE_COLLECTION_FAILED: &str = "Failed to delete collection";
pub const COLLECTION_NAME_REQUIRED: &str = "Collection name is required";

#[derive(Debug, Error)]
pub enum FailureKind {
    #[error("malformed request body: {0}")]
    MalformedBody(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),
}

impl FailureKind {
    fn label(&self) -> &'static str {
        match self {
            FailureKind::MalformedBody(_) => "malformed_body",
            FailureKind::Store(StoreError::NotFound(_)) => "not_found",
            FailureKind::Store(_) => "store",
            FailureKind::Search(_) => "search",
            FailureKind::MissingField(_) => "missing_field",
        }
    }

    /// Only a missing required field is the client's fault. Not-found and
    /// unparseable bodies still answer 500.
    fn status(&self) -> StatusCode {
        match self {
            FailureKind::MissingField(_) => StatusCode::BAD_REQUEST,
            FailureKind::MalformedBody(_) | FailureKind::Store(_) | FailureKind::Search(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn client_message(&self) -> String {
        match self {
            FailureKind::Search(e) => e.client_message(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// The response carries only `message`.
    #[error("{message}: {kind}")]
    Opaque {
        message: &'static str,
        kind: FailureKind,
    },

    /// The response carries `message` and the failure's text as `details`.
    #[error("{message}: {kind}")]
    Detailed {
        message: &'static str,
        kind: FailureKind,
    },

    /// A collection delete failed. The body is tagged `"status": "error"`.
    #[error("{message}: {kind}")]
    Deletion {
        message: &'static str,
        kind: FailureKind,
    },

    /// The search proxy failed; the response carries the failure's message.
    #[error("Search error: {0}")]
    Search(FailureKind),
}

impl ApiError {
    pub fn opaque(message: &'static str) -> impl FnOnce(FailureKind) -> ApiError {
        move |kind| ApiError::Opaque { message, kind }
    }

    pub fn detailed(message: &'static str) -> impl FnOnce(FailureKind) -> ApiError {
        move |kind| ApiError::Detailed { message, kind }
    }

    pub fn deletion(kind: FailureKind) -> ApiError {
        let message = match kind {
            FailureKind::MissingField(_) => COLLECTION_NAME_REQUIRED,
            _ => DELETE_COLLECTION_FAILED,
        };
        ApiError::Deletion { message, kind }
    }

    pub fn kind(&self) -> &FailureKind {
        match self {
            ApiError::Opaque { kind, .. }
            | ApiError::Detailed { kind, .. }
            | ApiError::Deletion { kind, .. }
            | ApiError::Search(kind) => kind,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = kind.status();
        error!(kind = kind.label(), "{}", self);

        match &self {
            ApiError::Opaque { message, .. } => (
                status,
                Json(ErrorResponse {
                    error: message.to_string(),
                }),
            )
                .into_response(),
            ApiError::Detailed { message, kind } => (
                status,
                Json(DetailedErrorResponse {
                    error: message.to_string(),
                    details: Some(kind.client_message()),
                    status: None,
                }),
            )
                .into_response(),
            ApiError::Deletion { message, kind } => (
                status,
                Json(DetailedErrorResponse {
                    error: message.to_string(),
                    details: match kind {
                        FailureKind::MissingField(_) => None,
                        other => Some(other.client_message()),
                    },
                    status: Some("error".to_string()),
                }),
            )
                .into_response(),
            ApiError::Search(kind) => (
                status,
                Json(SearchFailureResponse {
                    success: false,
                    error: kind.client_message(),
                }),
            )
                .into_response(),
        }
    }
}
