//! Application error types with HTTP status codes and JSON error responses.
//!
//! Two families reach the caller: validation errors (rejected before any cache
//! or network access) and upstream errors (the market-data API failed in a way
//! the gateway could not absorb). Distributed-cache faults never appear here;
//! the adapter in `redis.rs` degrades them to cache misses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

/// Unified error type for the gateway.
///
/// Implements `IntoResponse` so handlers can return `Result<_, AppError>`
/// directly. The JSON response shape is `{ "error": "...", "status"?, "detail"? }`,
/// where `status` is the upstream status code when one was observed.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16 },

    #[error("upstream unavailable after {attempts} attempts: {detail}")]
    UpstreamExhausted {
        attempts: u32,
        last_status: Option<u16>,
        detail: String,
    },
}

impl AppError {
    /// Returns the machine-readable error code (e.g. "upstream_error").
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::UpstreamStatus { .. } | Self::UpstreamExhausted { .. } => "upstream_error",
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamStatus { .. } | Self::UpstreamExhausted { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// The upstream HTTP status that caused this error, when one was observed.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Validation(_) => None,
            Self::UpstreamStatus { status } => Some(*status),
            Self::UpstreamExhausted { last_status, .. } => *last_status,
        }
    }
}

/// Wire shape for error responses.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Machine-readable error code ("validation_error" or "upstream_error").
    pub error: &'static str,
    /// Upstream HTTP status, present for gateway errors that observed one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Human-readable error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.code(),
            status: self.upstream_status(),
            detail: Some(self.to_string()),
        };
        (status, axum::Json(body)).into_response()
    }
}
