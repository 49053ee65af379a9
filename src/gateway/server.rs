//! Gateway router and listener.
//!
//! Endpoints:
//! - `GET /api/health`: liveness, `{"status":"OK"}`
//! - `{prefix}` and `{prefix}/*`: forwarded to the route's service
//! - anything else: `404 {"error":"Not Found"}`

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::auth::{require_auth, AuthProxy, UserIdentity};
use super::proxy::{ProxyRequest, Route, ServiceProxy, SharedRoute};
use super::{error_response, GatewayError};
use crate::breaker::CircuitBreaker;
use crate::config::GatewayConfig;

/// Largest inbound body the gateway buffers for forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
struct RouteState {
    route: SharedRoute,
    proxy: ServiceProxy,
}

/// Route table, auth proxy, and the shared HTTP client.
#[derive(Debug)]
pub struct Gateway {
    routes: Vec<SharedRoute>,
    auth: Option<Arc<AuthProxy>>,
    proxy: ServiceProxy,
}

impl Gateway {
    /// Validate the configuration and build one breaker per route.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        config.validate()?;

        let proxy = ServiceProxy::new(&config.identity_header)?;
        let auth = config
            .auth_endpoint
            .as_ref()
            .map(|endpoint| AuthProxy::new(endpoint.clone(), &config.breaker).map(Arc::new))
            .transpose()?;
        let routes = config
            .routes
            .iter()
            .map(|route| Arc::new(Route::new(route, &config.breaker)))
            .collect();

        Ok(Self {
            routes,
            auth,
            proxy,
        })
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().map(|route| route.as_ref())
    }

    /// Breaker guarding the named service (`auth` for the auth proxy).
    pub fn breaker(&self, service: &str) -> Option<&CircuitBreaker> {
        self.routes
            .iter()
            .find(|route| route.name == service)
            .map(|route| &route.breaker)
            .or_else(|| {
                self.auth
                    .as_ref()
                    .map(|auth| auth.breaker())
                    .filter(|breaker| breaker.name() == service)
            })
    }

    /// Build the axum router (separated for testing).
    pub fn router(&self) -> Router {
        let mut router = Router::new().route("/api/health", get(health));

        for route in &self.routes {
            let state = RouteState {
                route: route.clone(),
                proxy: self.proxy.clone(),
            };
            let mut service = Router::new()
                .route(&route.prefix, any(forward))
                .route(&format!("{}/", route.prefix), any(forward))
                .route(&format!("{}/*path", route.prefix), any(forward))
                .with_state(state);

            if route.authenticate {
                if let Some(auth) = &self.auth {
                    service = service.route_layer(from_fn_with_state(auth.clone(), require_auth));
                }
            }
            router = router.merge(service);
        }

        router
            .fallback(not_found)
            .layer(TraceLayer::new_for_http())
    }
}

/// Serve the gateway on `listener` until ctrl-c.
///
/// The actual bound port is logged, so a listener on port 0 can be discovered.
pub async fn serve(gateway: &Gateway, listener: TcpListener) -> Result<(), GatewayError> {
    let app = gateway.router();
    let addr = listener.local_addr()?;
    info!(port = addr.port(), routes = gateway.routes.len(), "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not Found")
}

async fn forward(State(state): State<RouteState>, request: Request<Body>) -> Response {
    let identity = request
        .extensions()
        .get::<UserIdentity>()
        .map(|identity| identity.0.clone());
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(route = %state.route.name, error = %e, "Failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "Invalid request body");
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let request = ProxyRequest {
        method: parts.method,
        path_and_query,
        headers: parts.headers,
        body,
        identity,
    };

    state
        .proxy
        .handle(&state.route, request)
        .await
        .into_response()
}
