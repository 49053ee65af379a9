//! Breaker-protected request forwarding.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{internal_error_response, unavailable_response, GatewayError};
use crate::breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use crate::config::RouteConfig;

/// Connection-level headers that must not be forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive" || name == header::CONTENT_LENGTH
}

/// A downstream service mounted under a path prefix, with its own breaker.
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub prefix: String,
    pub base_url: String,
    pub authenticate: bool,
    pub breaker: CircuitBreaker,
}

impl Route {
    pub fn new(config: &RouteConfig, breaker: &BreakerConfig) -> Self {
        Self {
            name: config.name.clone(),
            prefix: config.prefix.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            authenticate: config.authenticate,
            breaker: CircuitBreaker::new(config.name.clone(), breaker.clone()),
        }
    }

    /// Downstream URL for an inbound path (and query).
    pub fn target_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }
}

/// Inbound request as seen by the proxy.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Original path plus query string, e.g. `/api/scores/42?page=2`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Authenticated caller, if the route required authentication.
    pub identity: Option<Value>,
}

/// Downstream reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub data: Bytes,
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.data));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        response
    }
}

/// Why a forwarding call failed.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Transport error: {0}")]
    Transport(String),

    /// Downstream answered with a server error. Counted as a breaker failure
    /// but still passed through to the client.
    #[error("HTTP {}", .0.status.as_u16())]
    Status(ProxyResponse),

    #[error("Failed to read downstream body: {0}")]
    Body(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Forwards requests over a pooled HTTP client.
#[derive(Debug, Clone)]
pub struct ServiceProxy {
    client: reqwest::Client,
    identity_header: HeaderName,
}

impl ServiceProxy {
    pub fn new(identity_header: &str) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| GatewayError::Client(e.to_string()))?;

        Self::with_client(client, identity_header)
    }

    pub fn with_client(
        client: reqwest::Client,
        identity_header: &str,
    ) -> Result<Self, GatewayError> {
        let identity_header = HeaderName::from_bytes(identity_header.as_bytes()).map_err(|e| {
            GatewayError::Config(crate::config::ConfigError::Invalid {
                field: "gateway.identity_header".to_string(),
                reason: e.to_string(),
            })
        })?;

        Ok(Self {
            client,
            identity_header,
        })
    }

    pub fn identity_header(&self) -> &HeaderName {
        &self.identity_header
    }

    /// Forward through the route's breaker.
    pub async fn forward(
        &self,
        route: &Route,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, BreakerError<ForwardError>> {
        route.breaker.fire(|| self.send(route, request)).await
    }

    /// Forward and map the outcome to the client response.
    pub async fn handle(&self, route: &Route, request: ProxyRequest) -> Response {
        let outcome = self.forward(route, request).await;
        respond(route, outcome)
    }

    async fn send(
        &self,
        route: &Route,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, ForwardError> {
        let url = route.target_url(&request.path_and_query);
        let url = reqwest::Url::parse(&url)
            .map_err(|e| ForwardError::InvalidRequest(format!("{}: {}", url, e)))?;

        let mut headers = HeaderMap::with_capacity(request.headers.len() + 1);
        for (name, value) in &request.headers {
            if !is_hop_by_hop(name) && *name != self.identity_header {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Some(identity) = &request.identity {
            let encoded = serde_json::to_string(identity)
                .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
            let value = HeaderValue::from_bytes(encoded.as_bytes())
                .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
            headers.insert(self.identity_header.clone(), value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(headers);
        if request.method != Method::GET && request.method != Method::HEAD {
            builder = builder.body(request.body);
        }

        debug!(
            route = %route.name,
            method = %request.method,
            path = %request.path_and_query,
            "Forwarding request"
        );

        let response = builder
            .send()
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let data = response
            .bytes()
            .await
            .map_err(|e| ForwardError::Body(e.to_string()))?;

        let reply = ProxyResponse {
            status,
            headers,
            data,
        };

        if status.is_server_error() {
            return Err(ForwardError::Status(reply));
        }
        Ok(reply)
    }
}

/// Map a forwarding outcome to the client response.
pub(crate) fn respond(
    route: &Route,
    outcome: Result<ProxyResponse, BreakerError<ForwardError>>,
) -> Response {
    match outcome {
        Ok(reply) => reply.into_response(),
        Err(BreakerError::Failure(ForwardError::Status(reply))) => {
            warn!(route = %route.name, status = %reply.status, "Downstream server error");
            reply.into_response()
        }
        Err(e @ (BreakerError::Open { .. } | BreakerError::Timeout { .. })) => {
            warn!(route = %route.name, error = %e, "Service unavailable");
            unavailable_response(&route.name)
        }
        Err(BreakerError::Failure(e @ (ForwardError::Transport(_) | ForwardError::Body(_)))) => {
            warn!(route = %route.name, error = %e, "Service unreachable");
            unavailable_response(&route.name)
        }
        Err(e) => {
            error!(route = %route.name, error = %e, "Proxy failure");
            internal_error_response()
        }
    }
}

/// Shared handle used by the router.
pub(crate) type SharedRoute = Arc<Route>;
