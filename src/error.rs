//! Error taxonomy shared by every component.
//!
//! Validation and quota errors are surfaced to the caller directly; hardware
//! errors are captured at the hardware-thread boundary and re-raised here
//! with the original context attached. No variant ever carries
//! information belonging to a different tenant.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, thiserror::Error)]
pub enum HvError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("reconfiguration error: {0}")]
    ReconfigError(String),

    #[error("hardware thread timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HvError {
    fn status(&self) -> StatusCode {
        match self {
            HvError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            HvError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            HvError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            HvError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            HvError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            HvError::ReconfigError(_) => StatusCode::BAD_GATEWAY,
            HvError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            HvError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            HvError::Unauthenticated(_) => "unauthenticated",
            HvError::PermissionDenied(_) => "permission_denied",
            HvError::QuotaExceeded(_) => "quota_exceeded",
            HvError::InvalidArgument(_) => "invalid_argument",
            HvError::ResourceExhausted(_) => "resource_exhausted",
            HvError::ReconfigError(_) => "reconfig_error",
            HvError::Timeout => "timeout",
            HvError::Internal(_) => "internal",
        }
    }
}

/// RFC 7807 problem+json body, the same envelope shape the rest of this
/// codebase's handlers already return.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProblemDetails {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "requestId")]
    pub request_id: Option<String>,
}

impl IntoResponse for HvError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(kind = self.kind(), error = %self, "request failed");
        let body = ProblemDetails {
            r#type: format!("https://fpga-hv/errors/{}", self.kind()),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            detail: self.to_string(),
            request_id: None,
        };
        (status, Json(body)).into_response()
    }
}

pub type HvResult<T> = Result<T, HvError>;
