//! Gateway proxy against real downstream HTTP servers.
//!
//! Each test binds throwaway axum servers on 127.0.0.1:0 standing in for the
//! auth and scores services, then drives the gateway router directly.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{to_bytes, Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

use viewfinder::breaker::{BreakerConfig, CircuitState};
use viewfinder::config::{GatewayConfig, RouteConfig};
use viewfinder::gateway::Gateway;

#[derive(Debug, Clone)]
struct Captured {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Vec<u8>,
}

type Log = Arc<Mutex<Vec<Captured>>>;

async fn spawn(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Scores service double. Records every request it receives.
async fn scores_service(log: Log) -> SocketAddr {
    let record = move |method: Method, uri: Uri, headers: HeaderMap, body: Bytes| {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(Captured {
                method,
                uri: uri.to_string(),
                headers,
                body: body.to_vec(),
            });

            let path = uri.path().to_string();
            if path.ends_with("/missing") {
                (StatusCode::NOT_FOUND, Json(json!({ "error": "no such target" }))).into_response()
            } else if path.ends_with("/boom") {
                let body = Json(json!({ "error": "boom" }));
                (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
            } else if path.ends_with("/slow") {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                Json(json!({ "slow": true })).into_response()
            } else {
                (
                    [("x-score-version", "7")],
                    Json(json!({ "path": path })),
                )
                    .into_response()
            }
        }
    };
    spawn(Router::new().fallback(record)).await
}

/// Auth service double: `good` is the only valid token.
async fn auth_service() -> SocketAddr {
    let router = Router::new().route(
        "/api/auth/verify",
        post(|Json(body): Json<Value>| async move {
            if body["token"] == "good" {
                Json(json!({ "id": "u-1", "role": "judge" })).into_response()
            } else {
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad token" }))).into_response()
            }
        }),
    );
    spawn(router).await
}

fn gateway(scores: SocketAddr, auth: SocketAddr, breaker: BreakerConfig) -> Gateway {
    let config = GatewayConfig {
        auth_endpoint: Some(format!("http://{}/api/auth/verify", auth)),
        breaker,
        routes: vec![
            RouteConfig {
                name: "scores".to_string(),
                prefix: "/api/scores".to_string(),
                base_url: format!("http://{}", scores),
                authenticate: true,
            },
            RouteConfig {
                name: "targets".to_string(),
                prefix: "/api/targets".to_string(),
                base_url: format!("http://{}", scores),
                authenticate: false,
            },
        ],
        ..GatewayConfig::default()
    };
    Gateway::from_config(&config).unwrap()
}

fn breaker_config() -> BreakerConfig {
    BreakerConfig {
        timeout_ms: 300,
        volume_threshold: 2,
        reset_timeout_ms: 60_000,
        ..BreakerConfig::default()
    }
}

async fn body_json(response: Response) -> Value {
    let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_forwards_full_path_and_query() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());

    let resp = gateway
        .router()
        .oneshot(get("/api/targets/42?page=2"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-score-version"], "7");
    assert_eq!(body_json(resp).await, json!({ "path": "/api/targets/42" }));

    let captured = log.lock().unwrap().clone();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].method, Method::GET);
    assert_eq!(captured[0].uri, "/api/targets/42?page=2");
}

#[tokio::test]
async fn test_prefix_with_trailing_slash_is_forwarded() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());

    let resp = gateway
        .router()
        .oneshot(get("/api/targets/?city=Paris"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({ "path": "/api/targets/" }));
    let captured = log.lock().unwrap().clone();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].uri, "/api/targets/?city=Paris");
}

#[tokio::test]
async fn test_trailing_slash_still_requires_token() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());

    let resp = gateway.router().oneshot(get("/api/scores/")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_forwards_post_body() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/targets")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"title":"Paris at dusk"}"#))
        .unwrap();
    let resp = gateway.router().oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let captured = log.lock().unwrap().clone();
    assert_eq!(captured[0].method, Method::POST);
    assert_eq!(captured[0].body, br#"{"title":"Paris at dusk"}"#.to_vec());
    assert_eq!(captured[0].headers["content-type"], "application/json");
}

#[tokio::test]
async fn test_client_error_passes_through_without_tripping() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());

    for _ in 0..3 {
        let resp = gateway
            .router()
            .oneshot(get("/api/targets/missing"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await, json!({ "error": "no such target" }));
    }

    let breaker = gateway.breaker("targets").unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.stats().failures, 0);
}

#[tokio::test]
async fn test_server_errors_open_the_breaker() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());
    let router = gateway.router();

    for _ in 0..2 {
        let resp = router.clone().oneshot(get("/api/targets/boom")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await, json!({ "error": "boom" }));
    }
    assert_eq!(gateway.breaker("targets").unwrap().state(), CircuitState::Open);

    let resp = router.oneshot(get("/api/targets/1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(resp).await,
        json!({ "error": "Service Unavailable", "service": "targets" })
    );
    // Rejected without reaching the service.
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_slow_service_times_out_as_unavailable() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());

    let resp = gateway
        .router()
        .oneshot(get("/api/targets/slow"))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(resp).await,
        json!({ "error": "Service Unavailable", "service": "targets" })
    );
    assert_eq!(gateway.breaker("targets").unwrap().stats().failures, 1);
}

#[tokio::test]
async fn test_missing_token_is_401() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());

    let resp = gateway.router().oneshot(get("/api/scores/1")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await, json!({ "error": "Missing token" }));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_token_is_401() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());

    let req = Request::builder()
        .uri("/api/scores/1")
        .header("authorization", "Bearer forged")
        .body(Body::empty())
        .unwrap();
    let resp = gateway.router().oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await, json!({ "error": "Invalid token" }));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(gateway.breaker("auth").unwrap().stats().failures, 0);
}

#[tokio::test]
async fn test_identity_propagated_downstream() {
    let log = Log::default();
    let scores = scores_service(log.clone()).await;
    let gateway = gateway(scores, auth_service().await, breaker_config());

    let req = Request::builder()
        .uri("/api/scores/1")
        .header("authorization", "Bearer good")
        .header("x-user-identity", r#"{"id":"admin"}"#)
        .body(Body::empty())
        .unwrap();
    let resp = gateway.router().oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let captured = log.lock().unwrap().clone();
    assert_eq!(captured.len(), 1);

    let identities: Vec<_> = captured[0].headers.get_all("x-user-identity").iter().collect();
    assert_eq!(identities.len(), 1);
    let identity: Value = serde_json::from_slice(identities[0].as_bytes()).unwrap();
    assert_eq!(identity, json!({ "id": "u-1", "role": "judge" }));
    assert_eq!(captured[0].headers["authorization"], "Bearer good");
}

#[tokio::test]
async fn test_health_needs_no_downstream() {
    let log = Log::default();
    let gateway = gateway(scores_service(log).await, auth_service().await, breaker_config());

    let resp = gateway.router().oneshot(get("/api/health")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({ "status": "OK" }));
}
