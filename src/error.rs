//! Error taxonomy for the proxy pipeline.
//!
//! Every error that can surface to an HTTP client flows through `AppError`.
//! Internal glue code still uses `anyhow::Result` (config loading, the
//! credential store) and is converted to the nearest `AppError` variant at
//! the boundary where it would otherwise reach a handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Maximum number of bytes of an upstream error body kept for logging and
/// for the client-facing error payload.
const UPSTREAM_BODY_TRUNCATE: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    RequestInvalid(String),

    #[error("no provider available")]
    NoProviderAvailable,

    #[error("transformer '{adapter}' failed: {message}")]
    TransformerFailure { adapter: String, message: String },

    #[error("upstream returned {status}: {body}")]
    UpstreamError { status: u16, body: String },

    #[error("upstream returned a body that could not be parsed as JSON")]
    UpstreamInvalidBody,

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("circuit open for provider '{0}'")]
    CircuitOpen(String),

    #[error("credential missing for provider '{provider}': {instruction}")]
    CredentialMissing { provider: String, instruction: String },

    #[error("config invalid: {0}")]
    ConfigInvalid(String),
}

impl AppError {
    /// Build an `UpstreamError`, truncating the body to the hygiene limit.
    pub fn upstream(status: reqwest::StatusCode, body: impl AsRef<str>) -> Self {
        let body = body.as_ref();
        let truncated: String = body.chars().take(UPSTREAM_BODY_TRUNCATE).collect();
        AppError::UpstreamError {
            status: status.as_u16(),
            body: truncated,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::RequestInvalid(_) => "request_invalid",
            AppError::NoProviderAvailable => "no_provider_available",
            AppError::TransformerFailure { .. } => "transformer_failure",
            AppError::UpstreamError { .. } => "upstream_error",
            AppError::UpstreamInvalidBody => "upstream_invalid_body",
            AppError::UpstreamTimeout => "upstream_timeout",
            AppError::CircuitOpen(_) => "circuit_open",
            AppError::CredentialMissing { .. } => "credential_missing",
            AppError::ConfigInvalid(_) => "config_invalid",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::RequestInvalid(_) => StatusCode::BAD_REQUEST,
            AppError::NoProviderAvailable => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::TransformerFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::UpstreamError { status, .. } => {
                let status = *status;
                if status >= 500 {
                    StatusCode::BAD_GATEWAY
                } else {
                    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
            }
            AppError::UpstreamInvalidBody => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CredentialMissing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(kind = self.kind(), error = %self, "request failed");
        crate::metrics::record_error(self.kind());
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_body_is_truncated() {
        let long = "x".repeat(500);
        let err = AppError::upstream(reqwest::StatusCode::INTERNAL_SERVER_ERROR, &long);
        match err {
            AppError::UpstreamError { body, status } => {
                assert_eq!(body.len(), UPSTREAM_BODY_TRUNCATE);
                assert_eq!(status, 500);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn five_hundred_maps_to_bad_gateway() {
        let err = AppError::upstream(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn four_hundred_surfaces_verbatim() {
        let err = AppError::upstream(reqwest::StatusCode::NOT_FOUND, "missing");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn request_invalid_is_400() {
        assert_eq!(
            AppError::RequestInvalid("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn circuit_open_is_503() {
        assert_eq!(
            AppError::CircuitOpen("anthropic".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
