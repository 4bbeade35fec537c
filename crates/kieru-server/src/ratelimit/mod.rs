//! Fixed-window request counting with identifier-level lockouts.
//!
//! Both fail open: when the cache cannot answer, requests are allowed and
//! identifiers are treated as unlocked.

pub mod middleware;

use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::{lock_key, Cache};

pub use middleware::{enforce, RouteLimit};

/// Whose requests share a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Authenticated subject, falling back to the client IP.
    User,
    Ip,
    /// Unauthenticated traffic, counted per client IP.
    Anonymous,
    /// One counter for everyone.
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ip => "ip",
            Self::Anonymous => "anonymous",
            Self::Global => "global",
        }
    }
}

/// Limit attached to a route when the router is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub scope: Scope,
    pub limit: u32,
    pub window_secs: u64,
    /// How long the caller is locked out after exceeding `limit`.
    pub lock_minutes: u64,
}

impl RateLimitPolicy {
    pub const fn new(scope: Scope, limit: u32, window_secs: u64, lock_minutes: u64) -> Self {
        Self {
            scope,
            limit,
            window_secs,
            lock_minutes,
        }
    }

    pub const CREATE_SECRET: Self = Self::new(Scope::User, 30, 3600, 15);
    pub const ACCESS_SECRET: Self = Self::new(Scope::Ip, 50, 3600, 10);
    pub const VALIDATE_SECRET: Self = Self::new(Scope::User, 75, 3600, 10);
    pub const UPDATE_PASSWORD: Self = Self::new(Scope::User, 5, 600, 5);
    pub const LIST_SECRETS: Self = Self::new(Scope::User, 30, 300, 5);
    pub const SECRET_LOGS: Self = Self::new(Scope::User, 15, 300, 5);
    pub const DELETE_SECRET: Self = Self::new(Scope::User, 15, 300, 5);
    /// Bearer tokens refused by the identity provider, counted per client IP.
    pub const REJECTED_TOKEN: Self = Self::new(Scope::Ip, 20, 3600, 15);

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_minutes * 60)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    cache: Cache,
}

impl RateLimiter {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    /// Count one request against `key`. The first hit in a window starts
    /// the window's TTL. Returns false once the count exceeds `limit`.
    pub async fn try_consume(&self, key: &str, limit: u32, window: Duration) -> bool {
        let count = match self.cache.increment(key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key, error = %e, "rate limit backend unavailable, allowing request");
                return true;
            }
        };
        if count == 1 {
            if let Err(e) = self.cache.expire(key, window).await {
                warn!(key, error = %e, "could not start rate limit window");
            }
        }
        let allowed = count <= i64::from(limit);
        debug!(key, count, limit, allowed, "rate limit check");
        allowed
    }

    pub async fn lock(&self, identifier: &str, minutes: u64) {
        self.lock_for(identifier, Duration::from_secs(minutes * 60))
            .await
    }

    pub async fn lock_for(&self, identifier: &str, duration: Duration) {
        if let Err(e) = self.cache.set_ex(&lock_key(identifier), 1, duration).await {
            warn!(identifier, error = %e, "could not lock identifier");
        }
    }

    pub async fn is_locked(&self, identifier: &str) -> bool {
        match self.cache.exists(&lock_key(identifier)).await {
            Ok(locked) => locked,
            Err(e) => {
                warn!(identifier, error = %e, "lock check unavailable, treating as unlocked");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{down, stalled};

    #[tokio::test]
    async fn sixth_call_in_window_is_denied() {
        let limiter = RateLimiter::new(Cache::in_memory());
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            assert!(limiter.try_consume("k", 5, window).await);
        }
        assert!(!limiter.try_consume("k", 5, window).await);
        // Other keys are independent.
        assert!(limiter.try_consume("other", 5, window).await);
    }

    #[tokio::test]
    async fn window_resets_after_ttl() {
        let limiter = RateLimiter::new(Cache::in_memory());
        let window = Duration::from_millis(30);
        assert!(limiter.try_consume("k", 1, window).await);
        assert!(!limiter.try_consume("k", 1, window).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(limiter.try_consume("k", 1, window).await);
    }

    #[tokio::test]
    async fn lock_holds_until_expiry() {
        let limiter = RateLimiter::new(Cache::in_memory());
        assert!(!limiter.is_locked("1.2.3.4").await);

        limiter.lock_for("1.2.3.4", Duration::from_millis(40)).await;
        assert!(limiter.is_locked("1.2.3.4").await);
        assert!(!limiter.is_locked("5.6.7.8").await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!limiter.is_locked("1.2.3.4").await);
    }

    #[tokio::test]
    async fn minute_lock_is_in_force() {
        let limiter = RateLimiter::new(Cache::in_memory());
        limiter.lock("u1", 5).await;
        assert!(limiter.is_locked("u1").await);
    }

    #[tokio::test]
    async fn fails_open_when_backend_down() {
        let limiter = RateLimiter::new(down());
        for _ in 0..10 {
            assert!(limiter.try_consume("k", 1, Duration::from_secs(60)).await);
        }
        limiter.lock("u1", 5).await;
        assert!(!limiter.is_locked("u1").await);
    }

    #[tokio::test]
    async fn fails_open_on_timeout() {
        let limiter = RateLimiter::new(stalled());
        assert!(limiter.try_consume("k", 0, Duration::from_secs(60)).await);
        assert!(!limiter.is_locked("u1").await);
    }

    #[test]
    fn default_policies() {
        assert_eq!(RateLimitPolicy::UPDATE_PASSWORD.limit, 5);
        assert_eq!(RateLimitPolicy::UPDATE_PASSWORD.window(), Duration::from_secs(600));
        assert_eq!(RateLimitPolicy::ACCESS_SECRET.scope, Scope::Ip);
        assert_eq!(
            RateLimitPolicy::CREATE_SECRET.lock_duration(),
            Duration::from_secs(900)
        );
    }
}
