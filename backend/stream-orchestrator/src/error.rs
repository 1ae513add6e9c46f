use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;

pub type AppResult<T> = Result<T, AppError>;

/// Error taxonomy for the orchestration layer.
///
/// Validation/authorization/not-found/capacity errors are returned to the
/// caller as structured failures and never escape the signaling boundary as
/// panics. Engine failures are logged with full detail at the call site and
/// surfaced to clients as the generic `Engine` variant.
#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("incompatible rtp capabilities")]
    IncompatibleCapabilities,

    #[error("media engine error")]
    Engine,

    #[error("internal error")]
    Internal,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Wire shape of a failure, embedded in signaling replies and HTTP bodies.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WireError {
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Logs the underlying engine failure and returns the non-leaking
    /// `Engine` variant.
    pub fn from_engine(op: &'static str, err: EngineError) -> Self {
        tracing::error!(operation = op, error = %err, "engine call failed");
        AppError::Engine
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Authorization(_) => "authorization",
            AppError::NotFound(_) => "not_found",
            AppError::Capacity(_) => "capacity",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::IncompatibleCapabilities => "incompatible_capabilities",
            AppError::Engine => "engine",
            AppError::Internal => "internal",
            AppError::Config(_) => "config",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) | AppError::IncompatibleCapabilities => 400,
            AppError::Authorization(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::RateLimited { .. } => 429,
            AppError::Capacity(_) => 503,
            AppError::Engine => 502,
            AppError::Internal | AppError::Config(_) => 500,
        }
    }

    pub fn wire(&self) -> WireError {
        WireError {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(ResponseError::status_code(self))
            .json(serde_json::json!({ "error": self.wire() }))
    }
}
