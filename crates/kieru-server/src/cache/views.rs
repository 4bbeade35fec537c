//! Remaining-view counter kept in the cache, with the durable store as
//! ground truth for recovery.
//!
//! A hit decrements atomically in the cache and writes the new value behind
//! to the store. A miss reconciles from the store: the durable count is seeded
//! with set-if-absent (so concurrent reconcilers share one counter) and the
//! decrement is retried. When the cache itself fails, views are spent directly
//! against the store in one write transaction.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{views_left_key, Cache};
use crate::store::{SecretMetadata, SecretStore};

/// Default capacity of the write-behind queue.
pub const DEFAULT_WRITE_BEHIND_QUEUE: usize = 1024;

/// Result of trying to spend one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendOutcome {
    Granted { remaining: u32 },
    Exhausted,
    /// Found during reconciliation: no lifetime left to carry a counter.
    Expired,
}

enum WriteBehind {
    Record { id: String, remaining: u32 },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct ViewCounter {
    cache: Cache,
    store: Arc<dyn SecretStore>,
    tx: mpsc::Sender<WriteBehind>,
}

impl ViewCounter {
    /// Spawns the write-behind worker; must be called inside a tokio runtime.
    pub fn new(cache: Cache, store: Arc<dyn SecretStore>, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        tokio::spawn(run_write_behind(store.clone(), rx));
        Self { cache, store, tx }
    }

    /// Seed the counter for a fresh secret. Returns false when nothing was
    /// written, either because no lifetime remains or the cache refused it.
    pub async fn seed(&self, meta: &SecretMetadata, now: i64) -> bool {
        let ttl = meta.ttl_secs(now);
        if ttl <= 0 {
            return false;
        }
        let key = views_left_key(&meta.id);
        match self
            .cache
            .set_ex(&key, i64::from(meta.views_left), Duration::from_secs(ttl as u64))
            .await
        {
            Ok(()) => {
                debug!(id = %meta.id, ttl, "seeded view counter");
                true
            }
            Err(e) => {
                warn!(id = %meta.id, error = %e, "could not seed view counter");
                false
            }
        }
    }

    /// Spend one view of `meta`. The caller has already checked that the
    /// secret exists, is active and has not expired at `now`.
    pub async fn spend(&self, meta: &SecretMetadata, now: i64) -> Result<SpendOutcome> {
        let key = views_left_key(&meta.id);
        let max = i64::from(meta.max_views);

        match self.cache.decrement(&key).await {
            Ok(Some(r)) if (0..max).contains(&r) => {
                let remaining = r as u32;
                self.write_behind(&meta.id, remaining);
                Ok(SpendOutcome::Granted { remaining })
            }
            // The entry still holds the "already at zero" state.
            Ok(Some(r)) if r < 0 => {
                debug!(id = %meta.id, counter = r, "view counter exhausted");
                Ok(SpendOutcome::Exhausted)
            }
            Ok(Some(r)) => {
                warn!(id = %meta.id, counter = r, max_views = meta.max_views, "implausible view counter, reconciling");
                self.invalidate(&meta.id).await;
                self.reconcile(&meta.id, now).await
            }
            Ok(None) => {
                debug!(id = %meta.id, "view counter miss, reconciling");
                self.reconcile(&meta.id, now).await
            }
            Err(e) => {
                warn!(id = %meta.id, error = %e, "cache unavailable, spending against store");
                self.spend_durable(&meta.id)
            }
        }
    }

    /// Drop the cached counter, e.g. after a soft delete.
    pub async fn invalidate(&self, id: &str) {
        if let Err(e) = self.cache.delete(&views_left_key(id)).await {
            warn!(id = %id, error = %e, "could not drop view counter");
        }
    }

    /// Wait until every write-behind queued so far has been applied.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriteBehind::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    async fn reconcile(&self, id: &str, now: i64) -> Result<SpendOutcome> {
        let Some(meta) = self.store.find_metadata(id)? else {
            return Ok(SpendOutcome::Exhausted);
        };
        if meta.views_left == 0 {
            return Ok(SpendOutcome::Exhausted);
        }
        let ttl = meta.ttl_secs(now);
        if ttl <= 0 {
            self.store.deactivate(id)?;
            return Ok(SpendOutcome::Expired);
        }

        let key = views_left_key(id);
        let ttl = Duration::from_secs(ttl as u64);
        match self
            .cache
            .set_if_absent(&key, i64::from(meta.views_left), ttl)
            .await
        {
            Ok(seeded) => debug!(id = %id, seeded, views_left = meta.views_left, "repopulated view counter"),
            Err(e) => {
                warn!(id = %id, error = %e, "cache unavailable during reconcile, spending against store");
                return self.spend_durable(id);
            }
        }

        match self.cache.decrement(&key).await {
            Ok(Some(r)) if (0..i64::from(meta.max_views)).contains(&r) => {
                let remaining = r as u32;
                self.store.record_views_left(id, remaining)?;
                Ok(SpendOutcome::Granted { remaining })
            }
            Ok(Some(r)) if r < 0 => Ok(SpendOutcome::Exhausted),
            Ok(other) => {
                warn!(id = %id, counter = ?other, "view counter unusable after repopulation, spending against store");
                self.invalidate(id).await;
                self.spend_durable(id)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "cache unavailable during reconcile, spending against store");
                self.spend_durable(id)
            }
        }
    }

    fn spend_durable(&self, id: &str) -> Result<SpendOutcome> {
        Ok(match self.store.spend_view(id)? {
            Some(remaining) => SpendOutcome::Granted { remaining },
            None => SpendOutcome::Exhausted,
        })
    }

    fn write_behind(&self, id: &str, remaining: u32) {
        let update = WriteBehind::Record {
            id: id.to_owned(),
            remaining,
        };
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(update))
            | Err(mpsc::error::TrySendError::Closed(update)) => {
                debug!(id = %id, "write-behind queue unavailable, applying inline");
                apply(self.store.as_ref(), update);
            }
        }
    }
}

async fn run_write_behind(store: Arc<dyn SecretStore>, mut rx: mpsc::Receiver<WriteBehind>) {
    while let Some(update) = rx.recv().await {
        apply(store.as_ref(), update);
    }
}

fn apply(store: &dyn SecretStore, update: WriteBehind) {
    match update {
        WriteBehind::Record { id, remaining } => {
            if let Err(e) = store.record_views_left(&id, remaining) {
                warn!(id = %id, remaining, error = %e, "view count write-behind failed");
            }
        }
        WriteBehind::Flush(ack) => {
            let _ = ack.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{down, stalled};
    use crate::cache::{CacheBackend, MemoryCache, DEFAULT_CACHE_TIMEOUT};
    use crate::store::db::test_support::{make_store, sample};
    use crate::store::{unix_now, Store};

    fn counter_with(cache: Cache, store: &Store) -> ViewCounter {
        ViewCounter::new(cache, Arc::new(store.clone()), DEFAULT_WRITE_BEHIND_QUEUE)
    }

    fn create(store: &Store, id: &str, max_views: u32, expires_at: i64) -> SecretMetadata {
        let (meta, payload) = sample(id, None, max_views, expires_at, 0);
        store.create(&meta, &payload).unwrap();
        meta
    }

    #[tokio::test]
    async fn spends_down_to_exhausted() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 3, now + 60);
        let views = counter_with(Cache::in_memory(), &store);
        assert!(views.seed(&meta, now).await);

        for expected in [2, 1, 0] {
            assert_eq!(
                views.spend(&meta, now).await.unwrap(),
                SpendOutcome::Granted { remaining: expected }
            );
        }
        assert_eq!(views.spend(&meta, now).await.unwrap(), SpendOutcome::Exhausted);

        views.flush().await;
        let stored = store.find_metadata("S1").unwrap().unwrap();
        assert_eq!(stored.views_left, 0);
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn seed_skipped_without_lifetime() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 1, now);
        let mem = Arc::new(MemoryCache::new());
        let views = counter_with(Cache::new(mem.clone(), DEFAULT_CACHE_TIMEOUT), &store);

        assert!(!views.seed(&meta, now).await);
        assert!(!mem.exists(&views_left_key("S1")).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_spends_grant_exactly_max_views() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 10, now + 600);
        let views = counter_with(Cache::in_memory(), &store);
        views.seed(&meta, now).await;

        let mut handles = Vec::new();
        for _ in 0..50 {
            let views = views.clone();
            let meta = meta.clone();
            handles.push(tokio::spawn(async move { views.spend(&meta, now).await.unwrap() }));
        }
        let mut granted = 0;
        for h in handles {
            if let SpendOutcome::Granted { .. } = h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);

        views.flush().await;
        assert_eq!(store.find_metadata("S1").unwrap().unwrap().views_left, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reconcilers_share_one_counter() {
        let (store, _dir) = make_store();
        let now = unix_now();
        // Never seeded: every caller starts on the miss path.
        let meta = create(&store, "S1", 5, now + 600);
        let views = counter_with(Cache::in_memory(), &store);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let views = views.clone();
            let meta = meta.clone();
            handles.push(tokio::spawn(async move { views.spend(&meta, now).await.unwrap() }));
        }
        let mut granted = 0;
        for h in handles {
            if let SpendOutcome::Granted { .. } = h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn eviction_recovers_from_store_with_fresh_ttl() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 5, now + 600);
        let mem = Arc::new(MemoryCache::new());
        let views = counter_with(Cache::new(mem.clone(), DEFAULT_CACHE_TIMEOUT), &store);
        views.seed(&meta, now).await;

        views.spend(&meta, now).await.unwrap();
        views.spend(&meta, now).await.unwrap();
        views.flush().await;

        // Evict, then come back 100 seconds later.
        mem.delete(&views_left_key("S1")).await.unwrap();
        let later = now + 100;
        assert_eq!(
            views.spend(&meta, later).await.unwrap(),
            SpendOutcome::Granted { remaining: 2 }
        );
        assert_eq!(store.find_metadata("S1").unwrap().unwrap().views_left, 2);

        let ttl = mem.ttl(&views_left_key("S1")).unwrap().as_secs();
        assert!((495..=500).contains(&ttl), "ttl was {ttl}");

        // The repopulated counter keeps serving hits.
        assert_eq!(
            views.spend(&meta, later).await.unwrap(),
            SpendOutcome::Granted { remaining: 1 }
        );
    }

    #[tokio::test]
    async fn eviction_with_nothing_left_is_exhausted() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 1, now + 600);
        store.record_views_left("S1", 0).unwrap();
        let views = counter_with(Cache::in_memory(), &store);

        assert_eq!(views.spend(&meta, now).await.unwrap(), SpendOutcome::Exhausted);
    }

    #[tokio::test]
    async fn eviction_without_lifetime_deactivates() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 3, now + 10);
        let views = counter_with(Cache::in_memory(), &store);

        assert_eq!(
            views.spend(&meta, now + 10).await.unwrap(),
            SpendOutcome::Expired
        );
        assert!(!store.find_metadata("S1").unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn implausible_counter_is_replaced_from_store() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 3, now + 600);
        let mem = Arc::new(MemoryCache::new());
        let views = counter_with(Cache::new(mem.clone(), DEFAULT_CACHE_TIMEOUT), &store);
        mem.set_ex(&views_left_key("S1"), 50, Duration::from_secs(600))
            .await
            .unwrap();

        assert_eq!(
            views.spend(&meta, now).await.unwrap(),
            SpendOutcome::Granted { remaining: 2 }
        );
    }

    #[tokio::test]
    async fn unavailable_cache_falls_back_to_store() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 2, now + 600);
        let views = counter_with(down(), &store);
        assert!(!views.seed(&meta, now).await);

        assert_eq!(
            views.spend(&meta, now).await.unwrap(),
            SpendOutcome::Granted { remaining: 1 }
        );
        assert_eq!(
            views.spend(&meta, now).await.unwrap(),
            SpendOutcome::Granted { remaining: 0 }
        );
        assert_eq!(views.spend(&meta, now).await.unwrap(), SpendOutcome::Exhausted);
        assert!(!store.find_metadata("S1").unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn stalled_cache_times_out_to_store() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 1, now + 600);
        let views = counter_with(stalled(), &store);

        assert_eq!(
            views.spend(&meta, now).await.unwrap(),
            SpendOutcome::Granted { remaining: 0 }
        );
        assert_eq!(views.spend(&meta, now).await.unwrap(), SpendOutcome::Exhausted);
    }

    #[tokio::test]
    async fn full_queue_applies_inline() {
        let (store, _dir) = make_store();
        let now = unix_now();
        let meta = create(&store, "S1", 4, now + 600);
        let (tx, _rx) = mpsc::channel(1);
        // Receiver is held but never drained, so the queue fills after one update.
        let views = ViewCounter {
            cache: Cache::in_memory(),
            store: Arc::new(store.clone()),
            tx,
        };
        views.seed(&meta, now).await;

        views.spend(&meta, now).await.unwrap(); // queued
        views.spend(&meta, now).await.unwrap(); // inline
        assert_eq!(store.find_metadata("S1").unwrap().unwrap().views_left, 2);
    }
}
