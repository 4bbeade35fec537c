//! Redemption state machine.
//!
//! Checks run in a fixed order and stop at the first failure: existence,
//! deletion, expiry, activity, payload integrity, password, and finally the
//! view spend. Every terminal outcome is queued to the access log.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::{SpendOutcome, ViewCounter};
use crate::error::{AccessError, GoneReason};
use crate::log_sink::AccessLogSink;
use crate::store::crypto::verify_password;
use crate::store::{AccessLogEntry, ClientMeta, PayloadKind, SecretStore};

/// What a successful redemption hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantedSecret {
    pub id: String,
    pub secret_name: String,
    pub encrypted_content: String,
    #[serde(rename = "type")]
    pub kind: PayloadKind,
    pub views_left: u32,
    pub expires_at: i64,
    pub show_time_bomb: bool,
    pub view_time_seconds: u32,
}

#[derive(Clone)]
pub struct AccessGate {
    store: Arc<dyn SecretStore>,
    views: ViewCounter,
    sink: AccessLogSink,
}

impl AccessGate {
    pub fn new(store: Arc<dyn SecretStore>, views: ViewCounter, sink: AccessLogSink) -> Self {
        Self { store, views, sink }
    }

    /// Try to redeem `id` at `now`.
    pub async fn access(
        &self,
        id: &str,
        password: Option<&str>,
        now: i64,
        client: &ClientMeta,
    ) -> Result<GrantedSecret, AccessError> {
        let outcome = self.evaluate(id, password, now).await;

        let entry = match &outcome {
            Ok(_) => AccessLogEntry::new(id, now, client, true, None),
            Err(e) => AccessLogEntry::new(id, now, client, false, Some(e.log_reason())),
        };
        self.sink.enqueue(entry);

        match &outcome {
            Ok(granted) => info!(id = %id, views_left = granted.views_left, "secret redeemed"),
            // Already reported where it was detected.
            Err(AccessError::IntegrityViolation(_)) => {}
            Err(AccessError::Internal(e)) => error!(id = %id, error = %e, "redemption failed"),
            Err(e) => warn!(id = %id, ip = %client.ip_address, reason = e.log_reason(), "redemption denied"),
        }
        outcome
    }

    async fn evaluate(
        &self,
        id: &str,
        password: Option<&str>,
        now: i64,
    ) -> Result<GrantedSecret, AccessError> {
        let meta = self
            .store
            .find_metadata(id)?
            .ok_or(AccessError::NotFound)?;

        if meta.is_deleted {
            return Err(AccessError::Gone(GoneReason::Deleted));
        }
        if meta.is_expired_at(now) {
            self.store.expire_now(id, now)?;
            return Err(AccessError::Gone(GoneReason::Expired));
        }
        if !meta.is_active {
            let reason = if meta.views_left == 0 {
                GoneReason::Exhausted
            } else {
                GoneReason::Inactive
            };
            return Err(AccessError::Gone(reason));
        }

        let Some(payload) = self.store.find_payload(id)? else {
            error!(id = %id, "integrity violation: metadata present but payload missing");
            return Err(AccessError::IntegrityViolation(id.to_owned()));
        };

        if let Some(hash) = payload.password_hash.as_deref() {
            if !password.is_some_and(|p| verify_password(p, hash)) {
                return Err(AccessError::Forbidden);
            }
        }

        match self.views.spend(&meta, now).await? {
            SpendOutcome::Granted { remaining } => Ok(GrantedSecret {
                id: meta.id,
                secret_name: meta.secret_name,
                encrypted_content: payload.encrypted_content,
                kind: payload.kind,
                views_left: remaining,
                expires_at: meta.expires_at,
                show_time_bomb: meta.show_time_bomb,
                view_time_seconds: meta.view_time_seconds,
            }),
            SpendOutcome::Exhausted => {
                // Zero views left implies inactive; the durable row may still
                // be waiting on write-behind.
                self.store.record_views_left(id, 0)?;
                Err(AccessError::Gone(GoneReason::Exhausted))
            }
            SpendOutcome::Expired => Err(AccessError::Gone(GoneReason::Expired)),
        }
    }
}
