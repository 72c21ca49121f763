use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Order-level outcome of a matching run that did not produce an assignment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MatchError {
    #[error("no drivers available")]
    NoDriversAvailable,

    #[error("driver snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    #[error("order cancelled")]
    Cancelled,

    #[error("order {0} is already assigned")]
    AlreadyAssigned(Uuid),
}

impl MatchError {
    /// Transient failures the caller should retry after a short backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MatchError::SnapshotUnavailable(_))
    }

    pub fn outcome_label(&self) -> &'static str {
        match self {
            MatchError::NoDriversAvailable => "no_drivers",
            MatchError::SnapshotUnavailable(_) => "snapshot_unavailable",
            MatchError::Cancelled => "cancelled",
            MatchError::AlreadyAssigned(_) => "already_assigned",
        }
    }
}

impl From<MatchError> for AppError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::NoDriversAvailable | MatchError::SnapshotUnavailable(_) => {
                AppError::Unavailable(err.to_string())
            }
            MatchError::Cancelled | MatchError::AlreadyAssigned(_) => {
                AppError::Conflict(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("driver is locked by another offer")]
    Held,

    #[error("lock store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("notification gateway unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot provider unavailable: {0}")]
    Unavailable(String),
}

impl From<SnapshotError> for MatchError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Unavailable(reason) => MatchError::SnapshotUnavailable(reason),
        }
    }
}
