//! Gateway proxy.
//!
//! Routes inbound HTTP requests by path prefix to downstream services. Every
//! route owns its own circuit breaker; the forwarding call runs through it and
//! the outcome is mapped to the client-visible response:
//!
//! - downstream reply (any status) → passed through unchanged
//! - breaker open, timeout, or transport failure → `503 {error, service}`
//! - anything else → `500 {error}`
//!
//! Routes flagged `authenticate` first verify the bearer token with the auth
//! service (through its own breaker) and propagate the caller identity.

mod auth;
mod proxy;
mod server;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub use auth::{require_auth, AuthProxy, AuthRejection, UserIdentity, AUTH_SERVICE};
pub use proxy::{ForwardError, ProxyRequest, ProxyResponse, Route, ServiceProxy};
pub use server::{serve, Gateway};

use crate::config::ConfigError;

/// Errors building or running the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON error body with the given status.
pub(crate) fn error_response(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

/// `503` naming the unavailable downstream service.
pub(crate) fn unavailable_response(service: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "Service Unavailable", "service": service })),
    )
        .into_response()
}

/// Generic handler for unclassified failures.
pub(crate) fn internal_error_response() -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}
