//! Gateway configuration: listener, breaker options, and the route table.

use std::collections::HashSet;

use serde::Deserialize;

use super::ConfigError;
use crate::breaker::BreakerConfig;

/// Default header carrying the authenticated identity to downstream services.
pub const DEFAULT_IDENTITY_HEADER: &str = "x-user-identity";

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_identity_header() -> String {
    DEFAULT_IDENTITY_HEADER.to_string()
}

/// One downstream service mounted under a path prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConfig {
    /// Service name reported in 503 bodies and breaker events.
    pub name: String,
    /// Inbound path prefix, e.g. `/api/scores`.
    pub prefix: String,
    /// Downstream base URL; the original request path is appended.
    pub base_url: String,
    /// Require a valid bearer token before forwarding.
    #[serde(default)]
    pub authenticate: bool,
}

/// Gateway configuration.
///
/// A `gateway` section must carry `breaker`; loading fails without it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Token verification endpoint; required when any route authenticates.
    #[serde(default)]
    pub auth_endpoint: Option<String>,
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
    /// Breaker options shared by every route (each route gets its own breaker).
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_endpoint: None,
            identity_header: default_identity_header(),
            breaker: BreakerConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Socket address string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check breaker options and the route table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let breaker = &self.breaker;
        if breaker.timeout_ms == 0 {
            return Err(invalid("gateway.breaker.timeout_ms", "must be greater than zero"));
        }
        if breaker.error_threshold_percentage == 0 || breaker.error_threshold_percentage > 100 {
            return Err(invalid(
                "gateway.breaker.error_threshold_percentage",
                "must be between 1 and 100",
            ));
        }
        if breaker.reset_timeout_ms == 0 {
            return Err(invalid("gateway.breaker.reset_timeout_ms", "must be greater than zero"));
        }
        if breaker.rolling_count_timeout_ms == 0 {
            return Err(invalid(
                "gateway.breaker.rolling_count_timeout_ms",
                "must be greater than zero",
            ));
        }
        if breaker.half_open_max_calls == 0 {
            return Err(invalid("gateway.breaker.half_open_max_calls", "must be at least 1"));
        }

        if self.routes.is_empty() {
            return Err(ConfigError::Missing("gateway.routes".to_string()));
        }

        let mut prefixes = HashSet::new();
        for route in &self.routes {
            if route.name.trim().is_empty() {
                return Err(ConfigError::Missing(format!(
                    "gateway.routes[{}].name",
                    route.prefix
                )));
            }
            let trailing_slash = route.prefix.len() > 1 && route.prefix.ends_with('/');
            if !route.prefix.starts_with('/') || trailing_slash {
                return Err(invalid(
                    &format!("gateway.routes[{}].prefix", route.name),
                    "must start with '/' and not end with '/'",
                ));
            }
            if !prefixes.insert(route.prefix.as_str()) {
                return Err(invalid(
                    &format!("gateway.routes[{}].prefix", route.name),
                    "duplicate prefix",
                ));
            }
            if route.base_url.trim().is_empty() {
                return Err(ConfigError::Missing(format!(
                    "gateway.routes[{}].base_url",
                    route.name
                )));
            }
            check_http_url(
                &format!("gateway.routes[{}].base_url", route.name),
                &route.base_url,
            )?;
        }

        if self.routes.iter().any(|route| route.authenticate) {
            match &self.auth_endpoint {
                Some(endpoint) if !endpoint.trim().is_empty() => {
                    check_http_url("gateway.auth_endpoint", endpoint)?
                }
                _ => return Err(ConfigError::Missing("gateway.auth_endpoint".to_string())),
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn check_http_url(field: &str, raw: &str) -> Result<(), ConfigError> {
    let url = reqwest::Url::parse(raw).map_err(|e| invalid(field, &e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(field, &format!("unsupported scheme '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, prefix: &str, authenticate: bool) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            prefix: prefix.to_string(),
            base_url: format!("http://{}:8080", name),
            authenticate,
        }
    }

    fn valid() -> GatewayConfig {
        GatewayConfig {
            auth_endpoint: Some("http://auth:8080/api/auth/authenticate".to_string()),
            routes: vec![
                route("auth", "/api/auth", false),
                route("scores", "/api/scores", true),
                route("targets", "/api/targets", true),
            ],
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.listen_addr(), "0.0.0.0:3000");
        assert_eq!(config.identity_header, "x-user-identity");
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_valid_route_table() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_routes_required() {
        let err = GatewayConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(field) if field == "gateway.routes"));
    }

    #[test]
    fn test_authenticated_route_requires_auth_endpoint() {
        let mut config = valid();
        config.auth_endpoint = None;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(field) if field == "gateway.auth_endpoint"));
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let mut config = valid();
        config.routes[1].base_url = "scores:8080".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Invalid { .. }
        ));
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let mut config = valid();
        config.routes[2].prefix = "/api/scores".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut config = valid();
        config.breaker.error_threshold_percentage = 150;
        assert!(config.validate().is_err());
    }
}
