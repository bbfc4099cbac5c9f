use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::proxy::circuit_breaker::BreakerConfig;

/// Catch-all routes are additionally registered under these static prefixes.
const DEFAULT_STATIC_PREFIXES: &[&str] = &["/web", "/assets", "/static", "/public", "/images"];

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub default_backend: String,
    pub backends: Vec<String>,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_expiration: Duration,
    pub allowed_origins: Vec<String>,
    pub enable_metrics: bool,
    pub log_level: String,
    pub max_content_size: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: u32,
    pub routes_config_path: String,
    pub enable_caching: bool,
    pub cache_ttl: Duration,
    pub breaker: BreakerConfig,
    pub static_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            default_backend: "http://localhost:8081".to_string(),
            backends: vec!["http://localhost:8081".to_string()],
            jwt_secret: "your-secret-key".to_string(),
            jwt_issuer: "api-gateway".to_string(),
            jwt_expiration: Duration::from_secs(3600),
            allowed_origins: vec!["*".to_string()],
            enable_metrics: true,
            log_level: "info".to_string(),
            max_content_size: 10 * 1024 * 1024,
            read_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(120),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_requests: 200,
            routes_config_path: "configs/routes.json".to_string(),
            enable_caching: true,
            cache_ttl: Duration::from_secs(300),
            breaker: BreakerConfig::default(),
            static_prefixes: DEFAULT_STATIC_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl Config {
    /// Load configuration from the environment. Malformed values fall back
    /// to their defaults; a missing routes file is a fatal error.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config {
            port: get_env_parsed("PORT", 8080),
            default_backend: get_env("BACKEND_URL", "http://localhost:8081"),
            jwt_secret: get_env("JWT_SECRET", "your-secret-key"),
            jwt_issuer: get_env("JWT_ISSUER", "api-gateway"),
            jwt_expiration: Duration::from_secs(get_env_parsed("JWT_EXPIRATION", 3600)),
            allowed_origins: get_env_list("ALLOWED_ORIGINS", &["*"]),
            enable_metrics: get_env_parsed("ENABLE_METRICS", true),
            log_level: get_env("LOG_LEVEL", "info"),
            max_content_size: get_env_parsed("MAX_CONTENT_SIZE", 10 * 1024 * 1024),
            read_timeout: Duration::from_secs(get_env_parsed("READ_TIMEOUT", 20)),
            write_timeout: Duration::from_secs(get_env_parsed("WRITE_TIMEOUT", 20)),
            idle_timeout: Duration::from_secs(get_env_parsed("IDLE_TIMEOUT", 120)),
            rate_limit_window: Duration::from_secs(get_env_parsed("RATE_LIMIT_WINDOW", 60)),
            rate_limit_max_requests: get_env_parsed("RATE_LIMIT_MAX_REQUESTS", 200),
            routes_config_path: get_env("ROUTES_CONFIG_PATH", "configs/routes.json"),
            enable_caching: get_env_parsed("ENABLE_CACHING", true),
            cache_ttl: Duration::from_secs(get_env_parsed("CACHE_TTL", 300)),
            breaker: BreakerConfig {
                error_threshold: get_env_parsed("CIRCUIT_BREAKER_ERROR_THRESHOLD", 0.5),
                min_requests: get_env_parsed("CIRCUIT_BREAKER_MIN_REQUESTS", 10),
                timeout: Duration::from_secs(get_env_parsed("CIRCUIT_BREAKER_TIMEOUT", 60)),
                half_open_max: get_env_parsed("CIRCUIT_BREAKER_HALF_OPEN_REQS", 5),
                success_threshold: get_env_parsed("CIRCUIT_BREAKER_SUCCESS_THRESHOLD", 2),
            },
            static_prefixes: DEFAULT_STATIC_PREFIXES.iter().map(|p| p.to_string()).collect(),
            backends: Vec::new(),
        };

        let backends = get_env("BACKEND_URLS", "");
        cfg.backends = if backends.is_empty() {
            vec![cfg.default_backend.clone()]
        } else {
            backends.split(',').map(|url| url.trim().to_string()).collect()
        };

        if !Path::new(&cfg.routes_config_path).exists() {
            return Err(GatewayError::Config(format!(
                "routes configuration file does not exist: {}",
                cfg.routes_config_path
            )));
        }

        Ok(cfg)
    }

    /// Load and parse the route table.
    pub fn load_routes(&self) -> Result<Vec<Route>> {
        let data = std::fs::read_to_string(&self.routes_config_path).map_err(|e| {
            GatewayError::Config(format!(
                "failed to read routes file {}: {}",
                self.routes_config_path, e
            ))
        })?;

        let parsed: RoutesFile = serde_json::from_str(&data)
            .map_err(|e| GatewayError::Config(format!("failed to parse routes file: {}", e)))?;

        for route in &parsed.routes {
            route.validate()?;
        }

        Ok(parsed.routes)
    }
}

/// Structure of the routes.json document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutesFile {
    pub routes: Vec<Route>,
}

/// A single route binding a URL pattern and method set to a backend target.
/// Immutable after load.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Route {
    pub path: String,
    #[serde(rename = "targetURL")]
    pub target_url: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(rename = "stripPrefix", default)]
    pub strip_prefix: String,
    #[serde(rename = "requireAuth", default)]
    pub require_auth: bool,
    #[serde(default)]
    pub cacheable: bool,
    /// Per-route timeout in seconds; 0 disables the deadline.
    #[serde(default)]
    pub timeout: u64,
}

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

impl Route {
    fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "route path must start with '/': {:?}",
                self.path
            )));
        }
        if self.target_url.is_empty() {
            return Err(GatewayError::Config(format!(
                "route {} has no target URL",
                self.path
            )));
        }
        if self.methods.is_empty() {
            return Err(GatewayError::Config(format!(
                "route {} declares no methods",
                self.path
            )));
        }
        for method in &self.methods {
            if !ALLOWED_METHODS.contains(&method.to_uppercase().as_str()) {
                return Err(GatewayError::Config(format!(
                    "route {} declares unsupported method {}",
                    self.path, method
                )));
            }
        }
        Ok(())
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn get_env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => {
            value.split(',').map(|item| item.trim().to_string()).collect()
        }
        _ => default.iter().map(|item| item.to_string()).collect(),
    }
}

fn get_env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_route_document() {
        let raw = r#"{
            "routes": [
                {
                    "path": "/api/users",
                    "targetURL": "http://svc/users",
                    "methods": ["GET", "POST"],
                    "stripPrefix": "/api",
                    "requireAuth": true,
                    "cacheable": false,
                    "timeout": 20
                },
                {
                    "path": "/ws/chat",
                    "targetURL": "/chat",
                    "methods": ["GET"]
                }
            ]
        }"#;

        let parsed: RoutesFile = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.routes.len(), 2);

        let users = &parsed.routes[0];
        assert_eq!(users.path, "/api/users");
        assert_eq!(users.target_url, "http://svc/users");
        assert_eq!(users.methods, vec!["GET", "POST"]);
        assert_eq!(users.strip_prefix, "/api");
        assert!(users.require_auth);
        assert!(!users.cacheable);
        assert_eq!(users.timeout, 20);

        let ws = &parsed.routes[1];
        assert_eq!(ws.strip_prefix, "");
        assert!(!ws.require_auth);
        assert_eq!(ws.timeout, 0);
    }

    #[test]
    fn rejects_route_without_methods() {
        let route = Route {
            path: "/x".to_string(),
            target_url: "http://svc".to_string(),
            methods: vec![],
            strip_prefix: String::new(),
            require_auth: false,
            cacheable: false,
            timeout: 0,
        };
        assert!(route.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_method() {
        let route = Route {
            path: "/x".to_string(),
            target_url: "http://svc".to_string(),
            methods: vec!["BREW".to_string()],
            strip_prefix: String::new(),
            require_auth: false,
            cacheable: false,
            timeout: 0,
        };
        assert!(route.validate().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.rate_limit_max_requests, 200);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.static_prefixes.len(), 5);
        assert!((cfg.breaker.error_threshold - 0.5).abs() < f64::EPSILON);
    }
}
