//! viewfinder-gateway: routing gateway for the photo-competition services
//!
//! Routes inbound requests by path prefix to the downstream services, each
//! behind its own circuit breaker, and verifies bearer tokens with the auth
//! service for routes that require it.
//!
//! ## Architecture
//! ```text
//! [Client] -> [viewfinder-gateway] -> /api/auth/*    -> [auth]
//!                   |               -> /api/scores/*  -> [scores]  (token required)
//!                   |               -> /api/targets/* -> [targets] (token required)
//!                   v
//!            [auth verify endpoint]
//! ```
//!
//! ## Configuration
//! - `viewfinder.yaml` in the working directory, or the file named by
//!   `VIEWFINDER_CONFIG`
//! - `VIEWFINDER__GATEWAY__PORT`, `VIEWFINDER__GATEWAY__AUTH_ENDPOINT`, ...
//!   override individual settings
//! - `VIEWFINDER_LOG`: tracing filter (default: info)

use tokio::net::TcpListener;
use tracing::{error, info};

use viewfinder::config::Config;
use viewfinder::gateway::{serve, Gateway};
use viewfinder::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting viewfinder-gateway");

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let gateway = Gateway::from_config(&config.gateway).map_err(|e| {
        error!("Invalid gateway configuration: {}", e);
        e
    })?;

    for route in gateway.routes() {
        info!(
            service = %route.name,
            prefix = %route.prefix,
            target = %route.base_url,
            authenticate = route.authenticate,
            "Registered route"
        );
    }

    let listener = TcpListener::bind(config.gateway.listen_addr()).await?;
    serve(&gateway, listener).await?;

    Ok(())
}
