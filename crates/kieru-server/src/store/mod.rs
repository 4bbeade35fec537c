pub mod access_log;
pub mod crypto;
pub mod db;
pub mod model;

use anyhow::Result;

pub use access_log::{AccessLogEntry, ClientMeta, DeviceType};
pub use db::Store;
pub use model::{unix_now, PayloadKind, SecretMetadata, SecretPayload};

/// Durable persistence contract for secrets. This is the source of truth;
/// the gate, the view counter reconciliation and the reaper only ever talk
/// to storage through it.
///
/// Every method is a single atomic unit: either all of its writes commit or
/// none do.
pub trait SecretStore: Send + Sync {
    /// Insert metadata and payload together. Both must share the same id.
    fn create(&self, metadata: &SecretMetadata, payload: &SecretPayload) -> Result<()>;

    fn find_metadata(&self, id: &str) -> Result<Option<SecretMetadata>>;

    fn find_payload(&self, id: &str) -> Result<Option<SecretPayload>>;

    /// Overwrite the metadata row. Flag invariants are re-applied before writing.
    fn save(&self, metadata: &SecretMetadata) -> Result<()>;

    /// Mark deleted and inactive. Nothing is removed. Returns false if unknown.
    fn soft_delete(&self, id: &str) -> Result<bool>;

    /// Atomically spend one view against the durable counter.
    /// Returns the remaining count, or `None` when nothing was left to spend.
    fn spend_view(&self, id: &str) -> Result<Option<u32>>;

    /// Write-behind target: lower `views_left` to `remaining` (never raises it)
    /// and deactivate at zero.
    fn record_views_left(&self, id: &str, remaining: u32) -> Result<()>;

    /// Idempotent `is_active = false`.
    fn deactivate(&self, id: &str) -> Result<()>;

    /// Stamp `expires_at` with the detection time `now` and deactivate.
    /// Returns the updated record.
    fn expire_now(&self, id: &str, now: i64) -> Result<Option<SecretMetadata>>;

    /// Deactivate up to `limit` active secrets with `expires_at < now`.
    /// Returns how many were flipped.
    fn deactivate_expired(&self, now: i64, limit: usize) -> Result<usize>;

    /// Replace the payload's password hash and keep `password_protected` in step.
    /// Returns false if the payload does not exist.
    fn update_password_hash(&self, id: &str, password_hash: Option<String>) -> Result<bool>;

    /// Secrets created by `owner_id`, newest first.
    fn list_owned(
        &self,
        owner_id: &str,
        page: usize,
        size: usize,
        only_active: bool,
    ) -> Result<Vec<SecretMetadata>>;

    /// Append a log entry, allocating its id. Entries for unknown secrets are
    /// skipped and `None` is returned.
    fn append_access_log(&self, entry: AccessLogEntry) -> Result<Option<u64>>;

    /// Log entries for one secret, newest first.
    fn list_access_logs(&self, secret_id: &str, page: usize, size: usize)
        -> Result<Vec<AccessLogEntry>>;
}
