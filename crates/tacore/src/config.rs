use serde::{Deserialize, Serialize};

use crate::error::TacoreError;
use crate::transport::Transport;

/// Full configuration for the TACoreService process.
///
/// Resolved in increasing priority: compiled-in defaults, an optional TOML
/// file, then environment variable overrides (`TACORE_SECTION_KEY`
/// convention, e.g. `TACORE_ZMQ_FRONTEND_PORT`). CLI flags (see the
/// `tacore-broker`/`tacore-worker` binaries) sit on top of all three.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_frontend_port")]
    pub zmq_frontend_port: u16,

    #[serde(default = "default_backend_port")]
    pub zmq_backend_port: u16,

    #[serde(default = "default_bind_address")]
    pub zmq_bind_address: String,

    /// Host a worker dials to reach the backend ROUTER. `zmq_bind_address`
    /// is a bind-side wildcard (`*`) and is never a valid connect target, so
    /// workers resolve against this separate field instead.
    #[serde(default = "default_connect_host")]
    pub zmq_connect_host: String,

    #[serde(default = "default_http_host")]
    pub http_host: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_worker_count")]
    pub worker_count: u32,

    #[serde(default = "default_worker_timeout_seconds")]
    pub worker_timeout_seconds: u64,

    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,

    #[serde(default = "default_heartbeat_stale_factor")]
    pub heartbeat_stale_factor: u32,

    #[serde(default = "default_store_path")]
    pub store_path: String,

    pub cache_host: Option<String>,

    #[serde(default = "default_cache_port")]
    pub cache_port: u16,

    #[serde(default)]
    pub cache_db: u32,

    pub cache_password: Option<String>,

    #[serde(default = "default_metrics_interval_seconds")]
    pub metrics_collection_interval_seconds: u64,

    #[serde(default = "default_metrics_retention_days")]
    pub metrics_retention_days: u32,
}

fn default_service_name() -> String {
    "TACoreService".into()
}
fn default_frontend_port() -> u16 {
    5555
}
fn default_backend_port() -> u16 {
    5556
}
fn default_bind_address() -> String {
    "*".into()
}
fn default_connect_host() -> String {
    "127.0.0.1".into()
}
fn default_http_host() -> String {
    "0.0.0.0".into()
}
fn default_http_port() -> u16 {
    8000
}
fn default_worker_count() -> u32 {
    4
}
fn default_worker_timeout_seconds() -> u64 {
    30
}
fn default_heartbeat_interval_seconds() -> u64 {
    5
}
fn default_heartbeat_stale_factor() -> u32 {
    3
}
fn default_store_path() -> String {
    "data/tacoreservice.db".into()
}
fn default_cache_port() -> u16 {
    6379
}
fn default_metrics_interval_seconds() -> u64 {
    5
}
fn default_metrics_retention_days() -> u32 {
    7
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            debug: false,
            zmq_frontend_port: default_frontend_port(),
            zmq_backend_port: default_backend_port(),
            zmq_bind_address: default_bind_address(),
            zmq_connect_host: default_connect_host(),
            http_host: default_http_host(),
            http_port: default_http_port(),
            worker_count: default_worker_count(),
            worker_timeout_seconds: default_worker_timeout_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            heartbeat_stale_factor: default_heartbeat_stale_factor(),
            store_path: default_store_path(),
            cache_host: None,
            cache_port: default_cache_port(),
            cache_db: 0,
            cache_password: None,
            metrics_collection_interval_seconds: default_metrics_interval_seconds(),
            metrics_retention_days: default_metrics_retention_days(),
        }
    }
}

impl ServiceConfig {
    /// Parse config from a TOML string, then apply environment overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, TacoreError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a file path, falling back to defaults if absent.
    pub fn from_file_or_default(path: impl AsRef<std::path::Path>) -> Result<Self, TacoreError> {
        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Resolve configuration the way the service binaries do: load a
    /// `.env` file into the process environment if one is present (silently
    /// ignored otherwise), then run the usual TOML-then-env resolution.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, TacoreError> {
        let _ = dotenvy::dotenv();
        Self::from_file_or_default(path)
    }

    pub fn frontend_transport(&self) -> Transport {
        Transport::tcp(&self.zmq_bind_address, self.zmq_frontend_port)
    }

    pub fn backend_transport(&self) -> Transport {
        Transport::tcp(&self.zmq_bind_address, self.zmq_backend_port)
    }

    /// The endpoint a worker dials to reach the backend ROUTER.
    pub fn worker_backend_transport(&self) -> Transport {
        Transport::tcp(&self.zmq_connect_host, self.zmq_backend_port)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn stale_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.heartbeat_interval_seconds * self.heartbeat_stale_factor as u64,
        )
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `TACORE_SECTION_KEY` overrides `section_key`, e.g.
    /// `TACORE_ZMQ_FRONTEND_PORT`, `TACORE_STORE_PATH`, `TACORE_HTTP_PORT`.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TACORE_SERVICE_NAME") {
            self.service_name = v;
        }
        if let Ok(v) = std::env::var("TACORE_DEBUG") {
            self.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = env_u16("TACORE_ZMQ_FRONTEND_PORT") {
            self.zmq_frontend_port = v;
        }
        if let Some(v) = env_u16("TACORE_ZMQ_BACKEND_PORT") {
            self.zmq_backend_port = v;
        }
        if let Ok(v) = std::env::var("TACORE_ZMQ_BIND_ADDRESS") {
            self.zmq_bind_address = v;
        }
        if let Ok(v) = std::env::var("TACORE_ZMQ_CONNECT_HOST") {
            self.zmq_connect_host = v;
        }
        if let Ok(v) = std::env::var("TACORE_HTTP_HOST") {
            self.http_host = v;
        }
        if let Some(v) = env_u16("TACORE_HTTP_PORT") {
            self.http_port = v;
        }
        if let Some(v) = env_u32("TACORE_WORKER_COUNT") {
            self.worker_count = v;
        }
        if let Some(v) = env_u64("TACORE_WORKER_TIMEOUT_SECONDS") {
            self.worker_timeout_seconds = v;
        }
        if let Some(v) = env_u64("TACORE_HEARTBEAT_INTERVAL_SECONDS") {
            self.heartbeat_interval_seconds = v;
        }
        if let Some(v) = env_u32("TACORE_HEARTBEAT_STALE_FACTOR") {
            self.heartbeat_stale_factor = v;
        }
        if let Ok(v) = std::env::var("TACORE_STORE_PATH") {
            self.store_path = v;
        }
        if let Ok(v) = std::env::var("TACORE_CACHE_HOST") {
            self.cache_host = Some(v);
        }
        if let Some(v) = env_u16("TACORE_CACHE_PORT") {
            self.cache_port = v;
        }
        if let Some(v) = env_u32("TACORE_CACHE_DB") {
            self.cache_db = v;
        }
        if let Ok(v) = std::env::var("TACORE_CACHE_PASSWORD") {
            self.cache_password = Some(v);
        }
        if let Some(v) = env_u64("TACORE_METRICS_COLLECTION_INTERVAL_SECONDS") {
            self.metrics_collection_interval_seconds = v;
        }
        if let Some(v) = env_u32("TACORE_METRICS_RETENTION_DAYS") {
            self.metrics_retention_days = v;
        }
    }
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.service_name, "TACoreService");
        assert_eq!(cfg.zmq_frontend_port, 5555);
        assert_eq!(cfg.zmq_backend_port, 5556);
        assert_eq!(cfg.http_port, 8000);
        assert_eq!(cfg.worker_count, 4);
        assert_eq!(cfg.heartbeat_interval_seconds, 5);
        assert_eq!(cfg.heartbeat_stale_factor, 3);
        assert_eq!(cfg.metrics_retention_days, 7);
        assert!(!cfg.debug);
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let toml = r#"
service_name = "custom"
zmq_frontend_port = 6000
"#;
        let cfg = ServiceConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.service_name, "custom");
        assert_eq!(cfg.zmq_frontend_port, 6000);
        assert_eq!(cfg.zmq_backend_port, 5556);
    }

    #[test]
    fn stale_threshold_is_interval_times_factor() {
        let mut cfg = ServiceConfig::default();
        cfg.heartbeat_interval_seconds = 5;
        cfg.heartbeat_stale_factor = 3;
        assert_eq!(cfg.stale_threshold(), std::time::Duration::from_secs(15));
    }

    #[test]
    fn env_override_store_path() {
        // SAFETY: test-only, nextest runs each test in its own process
        unsafe {
            std::env::set_var("TACORE_STORE_PATH", "/tmp/override.db");
        }
        let cfg = ServiceConfig::from_toml("").unwrap();
        assert_eq!(cfg.store_path, "/tmp/override.db");
        unsafe {
            std::env::remove_var("TACORE_STORE_PATH");
        }
    }

    #[test]
    fn frontend_transport_uses_bind_address() {
        let mut cfg = ServiceConfig::default();
        cfg.zmq_bind_address = "127.0.0.1".into();
        cfg.zmq_frontend_port = 5555;
        assert_eq!(cfg.frontend_transport().endpoint(), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn worker_backend_transport_never_uses_bind_wildcard() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.zmq_bind_address, "*");
        assert_eq!(
            cfg.worker_backend_transport().endpoint(),
            "tcp://127.0.0.1:5556"
        );
    }
}
