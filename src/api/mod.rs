//! HTTP surface: human decisions on activities, run triggers, lead intake,
//! inbound recording and tracking endpoints.

pub mod routes;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{DatabaseError, ExecutorError};

pub use routes::{ApiState, api_routes};

/// Handler error rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Internal(m) => {
                tracing::error!(error = %m, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { .. } => Self::NotFound(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::ActivityNotFound { .. } | ExecutorError::LeadNotFound { .. } => {
                Self::NotFound(e.to_string())
            }
            ExecutorError::InvalidTransition { .. } => Self::Conflict(e.to_string()),
            ExecutorError::Database(db) => db.into(),
            ExecutorError::ActionFailed { .. } => Self::Internal(e.to_string()),
        }
    }
}
