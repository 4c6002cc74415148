//! Configuration management for the gateway.
//!
//! Process settings are loaded from environment variables following the
//! 12-factor app pattern. The declarative model (adapters and queries) lives
//! in its own file, pointed at by `TERSE_MODEL`.

use crate::constants::{
    DEFAULT_CACHE_MAX_COST_MB, DEFAULT_DRAIN_TIMEOUT, DEFAULT_DRAIN_TIMEOUT_SECS,
    DEFAULT_SSE_KEEPALIVE, DEFAULT_SSE_KEEPALIVE_SECS,
};
use crate::error::GatewayError;
use crate::transport::HttpConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the model file (YAML or JSON).
    pub model_path: PathBuf,

    /// HTTP listener configuration.
    pub http: HttpConfig,

    /// Binary RPC listener configuration.
    pub rpc: RpcConfig,

    /// Result cache configuration.
    pub cache: CacheConfig,

    /// Graceful shutdown configuration.
    pub shutdown: ShutdownConfig,
}

/// Binary RPC listener configuration.
#[derive(Debug, Clone, Default)]
pub struct RpcConfig {
    /// Listen address; the listener is disabled when unset.
    pub addr: Option<String>,
}

/// Result cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total estimated cost in MiB.
    pub max_cost_mb: u64,
}

/// Graceful shutdown configuration.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long the HTTP server may drain in-flight requests.
    pub drain_timeout: Duration,

    /// Interval between SSE keep-alive comments.
    pub sse_keepalive: Duration,
}

impl Config {
    /// Configuration with every setting at its default.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            http: HttpConfig::default(),
            rpc: RpcConfig::default(),
            cache: CacheConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, GatewayError> {
        // Required: model file
        let model_path = std::env::var("TERSE_MODEL")
            .map(PathBuf::from)
            .map_err(|_| GatewayError::config("TERSE_MODEL environment variable is required"))?;

        // Optional: RPC listener
        let rpc = RpcConfig {
            addr: std::env::var("TERSE_RPC_ADDR")
                .ok()
                .filter(|a| !a.trim().is_empty()),
        };

        let cache = CacheConfig {
            max_cost_mb: env_parse("TERSE_CACHE_MAX_COST_MB").unwrap_or(DEFAULT_CACHE_MAX_COST_MB),
        };

        let shutdown = ShutdownConfig {
            drain_timeout: Duration::from_secs(
                env_parse("TERSE_SHUTDOWN_DRAIN_TIMEOUT").unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS),
            ),
            sse_keepalive: Duration::from_secs(
                env_parse::<u64>("TERSE_SSE_KEEPALIVE")
                    .filter(|s| *s > 0)
                    .unwrap_or(DEFAULT_SSE_KEEPALIVE_SECS),
            ),
        };

        Ok(Self {
            model_path,
            http: HttpConfig::from_env(),
            rpc,
            cache,
            shutdown,
        })
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cost_mb: DEFAULT_CACHE_MAX_COST_MB,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            sse_keepalive: DEFAULT_SSE_KEEPALIVE,
        }
    }
}

/// Parse an environment variable, ignoring unset or malformed values.
pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Read a boolean environment variable (`true`/`1`).
pub(crate) fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "TERSE_MODEL",
        "TERSE_RPC_ADDR",
        "TERSE_CACHE_MAX_COST_MB",
        "TERSE_SHUTDOWN_DRAIN_TIMEOUT",
        "TERSE_SSE_KEEPALIVE",
        "TERSE_HTTP_PORT",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_model_is_required() {
        clear();
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("TERSE_MODEL"));
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        std::env::set_var("TERSE_MODEL", "model.yaml");
        let config = Config::from_env().unwrap();
        assert_eq!(config.model_path, PathBuf::from("model.yaml"));
        assert!(config.rpc.addr.is_none());
        assert_eq!(config.cache.max_cost_mb, 128);
        assert_eq!(config.shutdown.drain_timeout, Duration::from_secs(15));
        assert_eq!(config.shutdown.sse_keepalive, Duration::from_secs(10));
        assert_eq!(config.http.port, 8080);
        clear();
    }

    #[test]
    #[serial]
    fn test_overrides_and_malformed_values() {
        clear();
        std::env::set_var("TERSE_MODEL", "m.json");
        std::env::set_var("TERSE_RPC_ADDR", "127.0.0.1:9090");
        std::env::set_var("TERSE_CACHE_MAX_COST_MB", "64");
        std::env::set_var("TERSE_SSE_KEEPALIVE", "0");
        std::env::set_var("TERSE_HTTP_PORT", "not-a-port");
        let config = Config::from_env().unwrap();
        assert_eq!(config.rpc.addr.as_deref(), Some("127.0.0.1:9090"));
        assert_eq!(config.cache.max_cost_mb, 64);
        assert_eq!(config.shutdown.sse_keepalive, Duration::from_secs(10));
        assert_eq!(config.http.port, 8080);
        clear();
    }
}
