use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time;
use tracing::{info, warn};

use crate::store::{unix_now, SecretStore};

pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_REAPER_BATCH: usize = 100;
pub const DEFAULT_REAPER_HARD_CAP: usize = 10_000;

/// Deactivate active secrets whose expiry is before `now`, in batches of
/// `batch_size`, stopping at `hard_cap` or when a batch comes back short.
/// Returns how many secrets were deactivated.
pub fn sweep_expired(
    store: &dyn SecretStore,
    batch_size: usize,
    hard_cap: usize,
    now: i64,
) -> Result<usize> {
    let batch_size = batch_size.max(1);
    let mut total = 0;
    while total < hard_cap {
        let want = batch_size.min(hard_cap - total);
        let flipped = store.deactivate_expired(now, want)?;
        total += flipped;
        if flipped < want {
            break;
        }
    }
    Ok(total)
}

/// Run [`sweep_expired`] every `interval`.
pub fn spawn_reaper(
    store: Arc<dyn SecretStore>,
    interval: Duration,
    batch_size: usize,
    hard_cap: usize,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.tick().await; // skip first immediate tick
        loop {
            ticker.tick().await;
            match sweep_expired(store.as_ref(), batch_size, hard_cap, unix_now()) {
                Ok(0) => {}
                Ok(n) => info!(deactivated = n, "expired secrets deactivated"),
                Err(e) => warn!(error = %e, "expiry sweep error"),
            }
        }
    });
}
