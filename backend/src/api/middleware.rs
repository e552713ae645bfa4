use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::ingest::ValidationError;
use crate::validation::SafetyViolation;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsafe SQL: {0}")]
    SafetyViolation(#[from] SafetyViolation),

    #[error("Query timed out after {0} seconds")]
    Timeout(u64),

    #[error("SQL generation failed: {0}")]
    Generation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl AppError {
    /// Machine-readable code shown to callers
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(e) => e.code(),
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::SafetyViolation(_) => "SAFETY_VIOLATION",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Generation(_) => "GENERATION_ERROR",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(ValidationError::FileTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SafetyViolation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Generation(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let error_detail = match self {
            AppError::SafetyViolation(violation) => {
                ErrorDetail::new(code, violation.message.clone()).with_details(violation.code.as_str())
            }
            AppError::Timeout(secs) => ErrorDetail::new(
                code,
                format!(
                    "Query timed out after {} seconds. Consider narrowing the question or adding filters.",
                    secs
                ),
            ),
            AppError::Generation(msg) => {
                tracing::warn!("SQL generation failed: {}", msg);
                ErrorDetail::new(code, "Could not generate SQL for this question. Please try rephrasing it.")
                    .with_details(msg)
            }
            AppError::Database(msg) | AppError::Internal(msg) => {
                // Internal details go to the log, not to the caller
                tracing::error!("{}: {}", code, msg);
                ErrorDetail::new(code, "The request could not be completed.")
            }
            other => ErrorDetail::new(code, other.to_string()),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

/// Convert rusqlite::Error to AppError
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(format!("Background task failed: {}", err))
    }
}
