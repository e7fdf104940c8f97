//! Error types for CSV parsing, storage and the HTTP surface.

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failure to turn one uploaded CSV into grade records. Fatal to that file only.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{0} field not found in CSV header")]
    MissingField(&'static str),

    #[error("invalid grade value {value:?} on line {line}")]
    InvalidGrade { value: String, line: u64 },

    #[error("malformed CSV on line {line}: {message}")]
    Malformed { line: u64, message: String },

    #[error("failed to read CSV input: {0}")]
    Io(#[from] std::io::Error),
}

impl From<csv::Error> for ParseError {
    fn from(err: csv::Error) -> Self {
        let line = err.position().map(|pos| pos.line()).unwrap_or_default();
        let message = err.to_string();
        match err.into_kind() {
            csv::ErrorKind::Io(io) => ParseError::Io(io),
            _ => ParseError::Malformed { line, message },
        }
    }
}

/// Failure of one storage transaction. Earlier committed transactions stand.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    #[error("failed to execute batch upsert: {0}")]
    Execute(#[source] sqlx::Error),

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] sqlx::Error),
}

/// Errors surfaced by HTTP handlers before a response stream is started.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Multipart(err) => err.status(),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
