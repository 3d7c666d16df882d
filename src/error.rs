//! Error types for the store, configuration and HTTP layers

use std::path::PathBuf;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::{error, warn};

use crate::models::ApiResponse;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Event store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite operation failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored or ingested document is not valid JSON
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A line of an import file could not be parsed
    #[error("invalid document on line {line}: {source}")]
    InvalidDocument {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("document already exists: {0}")]
    Duplicate(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("store lock poisoned")]
    Lock,
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid bind address {0:?}")]
    InvalidAddr(String),
}

/// CSV export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to flush csv writer: {0}")]
    Flush(String),
}

/// Errors surfaced by HTTP handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Body missing, not JSON, or not the expected shape
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidBody(rejection) => rejection.status(),
            ApiError::Store(StoreError::InvalidInput(_))
            | ApiError::Store(StoreError::InvalidDocument { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Store(StoreError::Duplicate(_)) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, status = status.as_u16(), "request rejected");
        }

        let body = ApiResponse {
            status: "error".to_string(),
            message: self.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status_mapping() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Store(StoreError::Duplicate("id".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Store(StoreError::Lock).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
