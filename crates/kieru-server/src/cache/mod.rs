//! Ephemeral key/value infrastructure shared by the view counter and the
//! rate limiter. Entries carry an optional TTL and integer counters.

pub mod memory;
pub mod views;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

pub use memory::MemoryCache;
pub use views::{SpendOutcome, ViewCounter};

/// Default bound on a single cache call.
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_millis(250);

/// Counter operations a cache backend must provide. Each call is atomic per key.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Decrement and return the new value. Never creates a missing key:
    /// returns `None` when the entry is absent or already expired.
    async fn decrement(&self, key: &str) -> Result<Option<i64>, CacheError>;

    /// Increment and return the new value, creating the key at 1 (no TTL) when absent.
    async fn increment(&self, key: &str) -> Result<i64, CacheError>;

    /// Set a TTL on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    async fn set_ex(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError>;

    /// Write only if no live entry exists. Returns true when written.
    async fn set_if_absent(&self, key: &str, value: i64, ttl: Duration)
        -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Remove the key. Returns true if a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
}

/// Cloneable handle that runs every backend call under a timeout.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    timeout: Duration,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// In-process cache with the default timeout.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()), DEFAULT_CACHE_TIMEOUT)
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(self.timeout)),
        }
    }

    pub async fn decrement(&self, key: &str) -> Result<Option<i64>, CacheError> {
        self.bounded(self.backend.decrement(key)).await
    }

    pub async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        self.bounded(self.backend.increment(key)).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.bounded(self.backend.expire(key, ttl)).await
    }

    pub async fn set_ex(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
        self.bounded(self.backend.set_ex(key, value, ttl)).await
    }

    pub async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.bounded(self.backend.set_if_absent(key, value, ttl))
            .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.bounded(self.backend.exists(key)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.bounded(self.backend.delete(key)).await
    }
}

// ── Key namespace ────────────────────────────────────────────────────────────

pub fn views_left_key(secret_id: &str) -> String {
    format!("views:left:{secret_id}")
}

pub fn lock_key(identifier: &str) -> String {
    format!("limit:lock:{identifier}")
}

/// `scope` is `user` or `ip`; `date` is `YYYY-MM-DD`.
pub fn daily_quota_key(scope: &str, identifier: &str, date: &str) -> String {
    format!("limit:daily:{scope}:{identifier}:{date}")
}

pub fn window_key(scope: &str, method: &str, route: &str, identifier: &str) -> String {
    format!("ratelimit:{scope}:{method}:{route}:{identifier}")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Backend whose every call fails, standing in for an unreachable cache.
    pub struct DownCache;

    #[async_trait]
    impl CacheBackend for DownCache {
        async fn decrement(&self, _key: &str) -> Result<Option<i64>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn increment(&self, _key: &str) -> Result<i64, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set_ex(&self, _key: &str, _value: i64, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set_if_absent(
            &self,
            _key: &str,
            _value: i64,
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    /// Backend that never answers within any sane timeout.
    pub struct StalledCache;

    #[async_trait]
    impl CacheBackend for StalledCache {
        async fn decrement(&self, _key: &str) -> Result<Option<i64>, CacheError> {
            std::future::pending().await
        }
        async fn increment(&self, _key: &str) -> Result<i64, CacheError> {
            std::future::pending().await
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, CacheError> {
            std::future::pending().await
        }
        async fn set_ex(&self, _key: &str, _value: i64, _ttl: Duration) -> Result<(), CacheError> {
            std::future::pending().await
        }
        async fn set_if_absent(
            &self,
            _key: &str,
            _value: i64,
            _ttl: Duration,
        ) -> Result<bool, CacheError> {
            std::future::pending().await
        }
        async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
            std::future::pending().await
        }
    }

    pub fn down() -> Cache {
        Cache::new(Arc::new(DownCache), DEFAULT_CACHE_TIMEOUT)
    }

    pub fn stalled() -> Cache {
        Cache::new(Arc::new(StalledCache), Duration::from_millis(20))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_namespace() {
        assert_eq!(views_left_key("abc"), "views:left:abc");
        assert_eq!(lock_key("1.2.3.4"), "limit:lock:1.2.3.4");
        assert_eq!(
            daily_quota_key("user", "u1", "2024-05-01"),
            "limit:daily:user:u1:2024-05-01"
        );
        assert_eq!(
            window_key("ip", "POST", "/api/secrets", "1.2.3.4"),
            "ratelimit:ip:POST:/api/secrets:1.2.3.4"
        );
    }

    #[tokio::test]
    async fn stalled_backend_times_out() {
        let cache = test_support::stalled();
        let err = cache.increment("k").await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout(_)));
    }
}
