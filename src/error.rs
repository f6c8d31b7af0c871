//! # Error Handling
//!
//! HTTP-facing error type and the uniform `{result, content}` response envelope.
//!
//! Domain modules define their own `thiserror` enums (`ClientError`, `OrchestratorError`,
//! `StageError`, ...). Handlers convert those into [`AppError`] with `?`, and actix turns
//! an `AppError` into a response through the [`ResponseError`] trait.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: each variant is one kind of failure and carries its message
//! - **Pattern matching**: `match` picks the HTTP status per variant
//!
//! ### Traits for Error Conversion
//! - **From trait**: lets `?` convert domain errors into `AppError` automatically
//! - **ResponseError trait**: converts errors to HTTP responses
//! - **Display trait**: the message that ends up in `content`
//!
//! ## Status mapping:
//! - `BadRequest` → 400 (null, absent or malformed request body)
//! - `ServiceUnavailable` → 503 (the needed backing service is not bound)
//! - `Upstream` → 502 (a backing service or pipeline stage failed)
//! - `Internal` / `ConfigError` → 500

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use std::fmt;

use crate::clients::ClientError;
use crate::pipeline::StageError;
use crate::services::bindings::NotBound;
use crate::services::orchestrator::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ApiResult {
    Success,
    Error,
}

/// Body of every control-surface response.
///
/// ```json
/// { "result": "Success", "content": "generation engine: bound" }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ApiEnvelope {
    pub result: ApiResult,
    pub content: String,
}

impl ApiEnvelope {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            result: ApiResult::Success,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            result: ApiResult::Error,
            content: content.into(),
        }
    }

    /// 200 with a Success envelope.
    pub fn ok(content: impl Into<String>) -> HttpResponse {
        HttpResponse::Ok().json(Self::success(content))
    }
}

#[derive(Debug)]
pub enum AppError {
    /// Client sent a null, absent or malformed body
    BadRequest(String),

    /// The backing service a request needs is not bound
    ServiceUnavailable(String),

    /// A backing service or pipeline stage failed
    Upstream(String),

    Internal(String),

    ConfigError(String),
}

impl AppError {
    pub fn invalid_request() -> Self {
        AppError::BadRequest("Invalid request.".to_string())
    }

    fn message(&self) -> &str {
        match self {
            AppError::BadRequest(msg)
            | AppError::ServiceUnavailable(msg)
            | AppError::Upstream(msg)
            | AppError::Internal(msg)
            | AppError::ConfigError(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::Upstream(msg) => write!(f, "Upstream failure: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The envelope carries the bare message; the variant only decides the status.
    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ApiEnvelope::error(self.message()))
    }
}

impl From<NotBound> for AppError {
    fn from(err: NotBound) -> Self {
        AppError::ServiceUnavailable(err.to_string())
    }
}

impl From<ClientError> for AppError {
    fn from(err: ClientError) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl From<StageError> for AppError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::NotBound(err) => err.into(),
            other => AppError::Upstream(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
