//! Everything around redemption that the owner or creator drives: creation
//! under plan limits, validation, password changes, listings and soft delete.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::auth::Caller;
use crate::cache::{daily_quota_key, ViewCounter};
use crate::error::{CreateError, OwnerError};
use crate::plans::{Plan, PlanProvider};
use crate::ratelimit::RateLimiter;
use crate::store::crypto::{generate_secret_id, hash_password};
use crate::store::{AccessLogEntry, PayloadKind, SecretMetadata, SecretPayload, SecretStore};

pub const DEFAULT_MAX_VIEWS: u32 = 1;
pub const DEFAULT_VIEW_TIME_SECONDS: u32 = 120;
pub const DEFAULT_LIFETIME_SECS: i64 = 24 * 60 * 60;
pub const MAX_PAGE_SIZE: usize = 100;

const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const ID_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecretRequest {
    pub secret_name: String,
    /// Already encrypted by the client.
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: Option<PayloadKind>,
    pub password: Option<String>,
    pub max_views: Option<u32>,
    /// Unix seconds.
    pub expires_at: Option<i64>,
    pub view_time_seconds: Option<u32>,
    pub show_time_bomb: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSecret {
    pub id: String,
    pub secret_name: String,
    pub expires_at: i64,
    pub max_views: u32,
    pub view_time_seconds: u32,
}

/// Metadata view of a secret, never carrying content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSummary {
    pub id: String,
    pub secret_name: String,
    pub max_views: u32,
    pub views_left: u32,
    pub current_views: u32,
    pub is_active: bool,
    pub is_password_protected: bool,
    pub created_at: i64,
    pub expires_at: i64,
    pub show_time_bomb: bool,
    pub view_time_seconds: u32,
}

impl SecretSummary {
    fn at(meta: SecretMetadata, now: i64) -> Self {
        Self {
            is_active: meta.is_active && !meta.is_deleted && !meta.is_expired_at(now),
            current_views: meta.views_used(),
            max_views: meta.max_views,
            views_left: meta.views_left,
            is_password_protected: meta.password_protected,
            created_at: meta.created_at,
            expires_at: meta.expires_at,
            show_time_bomb: meta.show_time_bomb,
            view_time_seconds: meta.view_time_seconds,
            secret_name: meta.secret_name,
            id: meta.id,
        }
    }
}

#[derive(Clone)]
pub struct SecretService {
    store: Arc<dyn SecretStore>,
    views: ViewCounter,
    limiter: RateLimiter,
    plans: Arc<dyn PlanProvider>,
}

impl SecretService {
    pub fn new(
        store: Arc<dyn SecretStore>,
        views: ViewCounter,
        limiter: RateLimiter,
        plans: Arc<dyn PlanProvider>,
    ) -> Self {
        Self {
            store,
            views,
            limiter,
            plans,
        }
    }

    pub async fn create(
        &self,
        req: CreateSecretRequest,
        caller: &Caller,
        now: i64,
    ) -> Result<CreatedSecret, CreateError> {
        let name = req.secret_name.trim();
        if name.is_empty() {
            return Err(CreateError::Invalid("secretName must not be empty".into()));
        }
        if req.content.is_empty() {
            return Err(CreateError::Invalid("content must not be empty".into()));
        }
        let max_views = req.max_views.unwrap_or(DEFAULT_MAX_VIEWS);
        if max_views == 0 {
            return Err(CreateError::Invalid("maxViews must be at least 1".into()));
        }
        let kind = req.kind.unwrap_or(PayloadKind::Text);

        let plan = Plan::for_caller(
            caller.identity.is_some(),
            caller.identity.as_ref().and_then(|i| i.plan.as_deref()),
        );
        let limits = self.plans.limits(plan);
        match kind {
            PayloadKind::Text => {
                let size = req.content.chars().count();
                if size > limits.char_limit {
                    return Err(CreateError::ContentTooLong {
                        size,
                        max: limits.char_limit,
                    });
                }
            }
            PayloadKind::Image => {
                let size = req.content.len();
                if size > limits.file_size_limit {
                    return Err(CreateError::FileTooLarge {
                        size,
                        max: limits.file_size_limit,
                    });
                }
            }
        }

        let quota_scope = if caller.identity.is_some() { "user" } else { "ip" };
        let quota_key = daily_quota_key(quota_scope, caller.identifier(), &quota_date(now));
        if !self
            .limiter
            .try_consume(&quota_key, limits.daily_create_limit, DAILY_WINDOW)
            .await
        {
            info!(
                identifier = %caller.identifier(),
                plan = plan.as_str(),
                limit = limits.daily_create_limit,
                "daily creation quota exhausted"
            );
            return Err(CreateError::QuotaExceeded {
                limit: limits.daily_create_limit,
            });
        }

        let password_hash = match req.password.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => Some(hash_password(p)?),
            _ => None,
        };
        let expires_at = req.expires_at.unwrap_or(now + DEFAULT_LIFETIME_SECS);
        let id = self.fresh_id()?;

        let meta = SecretMetadata {
            id: id.clone(),
            owner_id: caller.subject_id().map(str::to_owned),
            secret_name: name.to_owned(),
            max_views,
            views_left: max_views,
            view_time_seconds: req.view_time_seconds.unwrap_or(DEFAULT_VIEW_TIME_SECONDS),
            show_time_bomb: req.show_time_bomb.unwrap_or(false),
            password_protected: password_hash.is_some(),
            expires_at,
            is_active: expires_at > now,
            is_deleted: false,
            created_at: now,
        };
        let payload = SecretPayload {
            id: id.clone(),
            encrypted_content: req.content,
            kind,
            password_hash,
        };
        self.store.create(&meta, &payload)?;
        self.views.seed(&meta, now).await;

        info!(
            id = %id,
            plan = plan.as_str(),
            max_views,
            expires_at,
            protected = meta.password_protected,
            "secret created"
        );
        Ok(CreatedSecret {
            id,
            secret_name: meta.secret_name,
            expires_at,
            max_views,
            view_time_seconds: meta.view_time_seconds,
        })
    }

    fn fresh_id(&self) -> anyhow::Result<String> {
        for _ in 0..ID_ATTEMPTS {
            let id = generate_secret_id();
            if self.store.find_metadata(&id)?.is_none() {
                return Ok(id);
            }
            debug!(id = %id, "secret id collision, retrying");
        }
        anyhow::bail!("could not allocate a free secret id")
    }

    /// Existence check without spending a view. Deleted secrets are still
    /// reported, as inactive, so clients can tell "gone" from "never existed".
    pub fn validate(&self, id: &str, now: i64) -> anyhow::Result<Option<SecretSummary>> {
        Ok(self
            .store
            .find_metadata(id)?
            .map(|m| SecretSummary::at(m, now)))
    }

    pub fn update_password(
        &self,
        id: &str,
        password: &str,
        subject_id: &str,
    ) -> Result<(), OwnerError> {
        let password = password.trim();
        if password.is_empty() {
            return Err(OwnerError::Invalid("password must not be empty".into()));
        }
        self.owned(id, subject_id)?;
        let hash = hash_password(password)?;
        if !self.store.update_password_hash(id, Some(hash))? {
            return Err(OwnerError::NotFound);
        }
        info!(id = %id, "secret password updated");
        Ok(())
    }

    pub fn list_owned(
        &self,
        subject_id: &str,
        page: usize,
        size: usize,
        only_active: bool,
        now: i64,
    ) -> anyhow::Result<Vec<SecretSummary>> {
        let secrets = self
            .store
            .list_owned(subject_id, page, clamp_page_size(size), only_active)
            .context("list owned secrets")?;
        Ok(secrets
            .into_iter()
            .map(|m| SecretSummary::at(m, now))
            .collect())
    }

    pub fn access_logs(
        &self,
        id: &str,
        subject_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Vec<AccessLogEntry>, OwnerError> {
        self.owned(id, subject_id)?;
        Ok(self
            .store
            .list_access_logs(id, page, clamp_page_size(size))?)
    }

    /// Flag the secret deleted and drop its cached counter. Nothing is removed.
    pub async fn soft_delete(&self, id: &str, subject_id: &str) -> Result<(), OwnerError> {
        self.owned(id, subject_id)?;
        if !self.store.soft_delete(id)? {
            return Err(OwnerError::NotFound);
        }
        self.views.invalidate(id).await;
        info!(id = %id, "secret deleted");
        Ok(())
    }

    fn owned(&self, id: &str, subject_id: &str) -> Result<SecretMetadata, OwnerError> {
        let meta = self
            .store
            .find_metadata(id)?
            .filter(|m| !m.is_deleted)
            .ok_or(OwnerError::NotFound)?;
        if meta.owner_id.as_deref() != Some(subject_id) {
            return Err(OwnerError::NotOwner);
        }
        Ok(meta)
    }
}

fn clamp_page_size(size: usize) -> usize {
    size.clamp(1, MAX_PAGE_SIZE)
}

/// UTC calendar day of `now`, as used in daily quota keys.
fn quota_date(now: i64) -> String {
    chrono::DateTime::from_timestamp(now, 0)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "invalid-date".into())
}
