//! Bearer-token authentication through the auth service.
//!
//! The token (second word of `Authorization`) is posted to the auth endpoint
//! as `{"token": ...}` under the auth breaker. A 2xx JSON reply becomes the
//! caller's [`UserIdentity`]; a 4xx means the token was rejected and does not
//! count against the breaker.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::{HeaderMap, AUTHORIZATION};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{error_response, GatewayError};
use crate::breaker::{BreakerConfig, CircuitBreaker};

/// Breaker name for the auth service.
pub const AUTH_SERVICE: &str = "auth";

/// Identity returned by the auth service, stored in request extensions.
#[derive(Debug, Clone, PartialEq)]
pub struct UserIdentity(pub Value);

/// Why a request was not authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    MissingToken,
    InvalidToken,
    Unavailable,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            AuthRejection::MissingToken => {
                error_response(StatusCode::UNAUTHORIZED, "Missing token")
            }
            AuthRejection::InvalidToken => {
                error_response(StatusCode::UNAUTHORIZED, "Invalid token")
            }
            AuthRejection::Unavailable => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, "Auth service unavailable")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum VerifyError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {0}")]
    Status(u16),
}

/// Calls the auth service's token verification endpoint.
#[derive(Debug)]
pub struct AuthProxy {
    client: reqwest::Client,
    endpoint: String,
    breaker: CircuitBreaker,
}

impl AuthProxy {
    pub fn new(endpoint: impl Into<String>, breaker: &BreakerConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            breaker: CircuitBreaker::new(AUTH_SERVICE, breaker.clone()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Verify the bearer token carried by `headers`.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<UserIdentity, AuthRejection> {
        let token = bearer_token(headers).ok_or(AuthRejection::MissingToken)?;

        match self.breaker.fire(|| self.verify(token)).await {
            Ok(Some(identity)) => Ok(UserIdentity(identity)),
            Ok(None) => Err(AuthRejection::InvalidToken),
            Err(e) => {
                warn!(error = %e, "Auth service unavailable");
                Err(AuthRejection::Unavailable)
            }
        }
    }

    /// `Ok(None)` when the auth service rejects the token.
    async fn verify(&self, token: &str) -> Result<Option<Value>, VerifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|e| VerifyError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(VerifyError::Status(status.as_u16()));
        }
        if !status.is_success() {
            debug!(status = %status, "Token rejected");
            return Ok(None);
        }

        match response.json::<Value>().await {
            Ok(identity) => Ok(Some(identity)),
            Err(e) => {
                debug!(error = %e, "Auth reply is not JSON");
                Ok(None)
            }
        }
    }
}

/// Second whitespace-separated word of the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .split_whitespace()
        .nth(1)
}

/// Middleware rejecting unauthenticated requests and attaching [`UserIdentity`].
pub async fn require_auth(
    State(auth): State<Arc<AuthProxy>>,
    mut request: Request,
    next: Next,
) -> Response {
    match auth.authenticate(request.headers()).await {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(rejection) => rejection.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_second_word() {
        assert_eq!(bearer_token(&headers("Bearer abc.def")), Some("abc.def"));
    }

    #[test]
    fn test_bearer_token_missing() {
        assert_eq!(bearer_token(&HeaderMap::new()), None);
        assert_eq!(bearer_token(&headers("Bearer")), None);
    }

    #[tokio::test]
    async fn test_missing_token_rejected_without_calling_service() {
        let auth = AuthProxy::new("http://127.0.0.1:9/verify", &BreakerConfig::default()).unwrap();

        let result = auth.authenticate(&HeaderMap::new()).await;

        assert_eq!(result, Err(AuthRejection::MissingToken));
        assert_eq!(auth.breaker().stats().total, 0);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_unavailable() {
        let auth = AuthProxy::new("http://127.0.0.1:9/verify", &BreakerConfig::default()).unwrap();

        let result = auth.authenticate(&headers("Bearer token")).await;

        assert_eq!(result, Err(AuthRejection::Unavailable));
        assert_eq!(auth.breaker().stats().failures, 1);
    }

    #[test]
    fn test_rejection_statuses() {
        assert_eq!(
            AuthRejection::MissingToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthRejection::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthRejection::Unavailable.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
