//! Optional TTL-namespaced key/value cache for market data and analysis
//! results. Degrades to a transparent no-op when the backend is
//! unreachable; the broker and worker never depend on it for correctness.

use std::time::Duration;

use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;

use crate::config::ServiceConfig;

/// Cache namespaces and their default TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Request,
    MarketData,
    Analysis,
    Session,
    Metrics,
    Config,
}

impl Namespace {
    fn prefix(self) -> &'static str {
        match self {
            Self::Request => "tacoreservice:request:",
            Self::MarketData => "tacoreservice:market:",
            Self::Analysis => "tacoreservice:analysis:",
            Self::Session => "tacoreservice:session:",
            Self::Metrics => "tacoreservice:metrics:",
            Self::Config => "tacoreservice:config:",
        }
    }

    fn default_ttl(self) -> Duration {
        match self {
            Self::Request => Duration::from_secs(3600),
            Self::MarketData => Duration::from_secs(300),
            Self::Analysis => Duration::from_secs(1800),
            Self::Session => Duration::from_secs(3600),
            Self::Metrics => Duration::from_secs(300),
            Self::Config => Duration::from_secs(86_400),
        }
    }
}

/// A key/value cache fronting an external backend. Construction never
/// fails: an unreachable backend simply leaves the cache disabled, mirroring
/// the degrade-to-no-op policy below.
pub struct Cache {
    conn: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl Cache {
    /// Attempt to connect using the service configuration. Returns a
    /// disabled cache (not an error) if `cache_host` is unset or the
    /// connection attempt fails.
    pub async fn connect(config: &ServiceConfig) -> Self {
        let Some(host) = &config.cache_host else {
            return Self { conn: Mutex::new(None) };
        };

        let url = match &config.cache_password {
            Some(pw) => format!(
                "redis://:{pw}@{host}:{port}/{db}",
                port = config.cache_port,
                db = config.cache_db
            ),
            None => format!(
                "redis://{host}:{port}/{db}",
                port = config.cache_port,
                db = config.cache_db
            ),
        };

        let conn = match redis::Client::open(url) {
            Ok(client) => client.get_multiplexed_tokio_connection().await.ok(),
            Err(_) => None,
        };

        if conn.is_none() {
            tracing::warn!(cache_host = %host, "cache backend unreachable, caching disabled");
        }

        Self { conn: Mutex::new(conn) }
    }

    /// An always-disabled cache, for workers/tests that run without a
    /// configured backend.
    pub fn disabled() -> Self {
        Self { conn: Mutex::new(None) }
    }

    pub async fn is_available(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    pub async fn set<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return false;
        };

        let Ok(payload) = serde_json::to_string(value) else {
            return false;
        };
        let ttl = ttl.unwrap_or_else(|| namespace.default_ttl());
        let full_key = format!("{}{key}", namespace.prefix());

        let result: redis::RedisResult<()> = conn
            .set_ex(&full_key, payload, ttl.as_secs().max(1))
            .await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "cache set failed, degrading to no-op");
            *guard = None;
            return false;
        }
        true
    }

    pub async fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut()?;

        let full_key = format!("{}{key}", namespace.prefix());
        let raw: redis::RedisResult<Option<String>> = conn.get(&full_key).await;
        match raw {
            Ok(Some(payload)) => serde_json::from_str(&payload).ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "cache get failed, degrading to no-op");
                *guard = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_cache_reports_unavailable() {
        let cache = Cache::disabled();
        assert!(!cache.is_available().await);
    }

    #[tokio::test]
    async fn disabled_cache_get_returns_none() {
        let cache = Cache::disabled();
        let got: Option<String> = cache.get(Namespace::MarketData, "AAPL").await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn disabled_cache_set_reports_failure_without_panicking() {
        let cache = Cache::disabled();
        let ok = cache
            .set(Namespace::Session, "s1", &"value", None)
            .await;
        assert!(!ok);
    }

    #[test]
    fn namespace_ttls_are_per_namespace() {
        assert_eq!(Namespace::MarketData.default_ttl(), Duration::from_secs(300));
        assert_eq!(Namespace::Config.default_ttl(), Duration::from_secs(86_400));
    }
}
