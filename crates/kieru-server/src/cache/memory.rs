use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time;
use tracing::debug;

use super::CacheBackend;
use crate::error::CacheError;

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: i64,
    expires_at: Option<Instant>,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

/// In-process cache backend. Atomicity per key comes from holding the
/// DashMap shard lock for the whole read-modify-write.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Slot>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries whose TTL has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Remaining TTL of a live entry, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|slot| slot.live(now))
            .and_then(|slot| slot.expires_at)
            .map(|t| t.saturating_duration_since(now))
    }

    /// Periodically purge expired entries so abandoned keys do not accumulate.
    pub fn spawn_purge(self: std::sync::Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    debug!(purged, "purged expired cache entries");
                }
            }
        });
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn decrement(&self, key: &str) -> Result<Option<i64>, CacheError> {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut o) => {
                if o.get().live(now) {
                    let slot = o.get_mut();
                    slot.value -= 1;
                    Ok(Some(slot.value))
                } else {
                    o.remove();
                    Ok(None)
                }
            }
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        let now = Instant::now();
        let mut slot = self.entries.entry(key.to_owned()).or_insert(Slot {
            value: 0,
            expires_at: None,
        });
        if !slot.live(now) {
            *slot = Slot {
                value: 0,
                expires_at: None,
            };
        }
        slot.value += 1;
        Ok(slot.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut o) => {
                if o.get().live(now) {
                    o.get_mut().expires_at = Some(now + ttl);
                    Ok(true)
                } else {
                    o.remove();
                    Ok(false)
                }
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn set_ex(&self, key: &str, value: i64, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_owned(),
            Slot {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let fresh = Slot {
            value,
            expires_at: Some(now + ttl),
        };
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut o) => {
                if o.get().live(now) {
                    Ok(false)
                } else {
                    o.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(v) => {
                v.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self.entries.get(key).is_some_and(|slot| slot.live(now)))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, slot)| slot.live(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn decrement_never_creates() {
        let c = MemoryCache::new();
        assert_eq!(c.decrement("k").await.unwrap(), None);
        assert!(!c.exists("k").await.unwrap());

        c.set_ex("k", 2, MINUTE).await.unwrap();
        assert_eq!(c.decrement("k").await.unwrap(), Some(1));
        assert_eq!(c.decrement("k").await.unwrap(), Some(0));
        assert_eq!(c.decrement("k").await.unwrap(), Some(-1));
    }

    #[tokio::test]
    async fn increment_creates_without_ttl() {
        let c = MemoryCache::new();
        assert_eq!(c.increment("k").await.unwrap(), 1);
        assert_eq!(c.increment("k").await.unwrap(), 2);
        assert!(c.ttl("k").is_none());
        assert!(c.expire("k", MINUTE).await.unwrap());
        assert!(c.ttl("k").is_some());
        assert!(!c.expire("missing", MINUTE).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_behave_as_absent() {
        let c = MemoryCache::new();
        c.set_ex("k", 5, Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!c.exists("k").await.unwrap());
        assert_eq!(c.decrement("k").await.unwrap(), None);
        assert!(c.set_if_absent("k", 7, MINUTE).await.unwrap());
        assert_eq!(c.decrement("k").await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn set_if_absent_keeps_live_value() {
        let c = MemoryCache::new();
        assert!(c.set_if_absent("k", 3, MINUTE).await.unwrap());
        assert!(!c.set_if_absent("k", 9, MINUTE).await.unwrap());
        assert_eq!(c.decrement("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn delete_and_purge() {
        let c = MemoryCache::new();
        c.set_ex("a", 1, MINUTE).await.unwrap();
        c.set_ex("b", 1, Duration::from_millis(5)).await.unwrap();
        assert!(c.delete("a").await.unwrap());
        assert!(!c.delete("a").await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(c.purge_expired(), 1);
    }

    #[tokio::test]
    async fn concurrent_decrements_are_atomic() {
        let c = Arc::new(MemoryCache::new());
        c.set_ex("k", 100, MINUTE).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..100 {
            let c = c.clone();
            handles.push(tokio::spawn(async move { c.decrement("k").await.unwrap() }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<i64>>());
    }
}
