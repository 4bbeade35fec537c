use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current Unix timestamp in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Kind of content carried by a secret. The content itself is opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PayloadKind {
    Text,
    Image,
}

impl PayloadKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TEXT" => Some(Self::Text),
            "IMAGE" => Some(Self::Image),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
        }
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumption state of a secret. Stored in redb as bincode-encoded bytes,
/// separately from the payload so that the gate and the reaper never have to
/// load content to make a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretMetadata {
    /// Random opaque token, shared with the payload row.
    pub id: String,
    /// Subject id of the creator; `None` for anonymous secrets.
    pub owner_id: Option<String>,
    pub secret_name: String,
    pub max_views: u32,
    pub views_left: u32,
    /// Display hint for clients, not enforced here.
    pub view_time_seconds: u32,
    pub show_time_bomb: bool,
    /// Mirrors `SecretPayload::password_hash.is_some()`.
    pub password_protected: bool,
    /// Unix timestamp (seconds). A secret is expired at and after this instant.
    pub expires_at: i64,
    pub is_active: bool,
    pub is_deleted: bool,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

impl SecretMetadata {
    /// Expiry is inclusive: a request at exactly `expires_at` is too late.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Seconds of lifetime left at `now`; zero or negative once expired.
    pub fn ttl_secs(&self, now: i64) -> i64 {
        self.expires_at - now
    }

    pub fn views_used(&self) -> u32 {
        self.max_views.saturating_sub(self.views_left)
    }

    /// Re-establish the flag invariants after a mutation.
    pub(crate) fn normalize(&mut self) {
        self.views_left = self.views_left.min(self.max_views);
        if self.views_left == 0 || self.is_deleted {
            self.is_active = false;
        }
    }
}

/// Content row, 1:1 with `SecretMetadata` under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretPayload {
    pub id: String,
    /// Client-side encrypted content, passed through untouched.
    pub encrypted_content: String,
    pub kind: PayloadKind,
    /// Argon2 PHC string. `None` means the secret has no password.
    pub password_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(expires_at: i64) -> SecretMetadata {
        SecretMetadata {
            id: "abc".into(),
            owner_id: None,
            secret_name: "n".into(),
            max_views: 3,
            views_left: 3,
            view_time_seconds: 120,
            show_time_bomb: false,
            password_protected: false,
            expires_at,
            is_active: true,
            is_deleted: false,
            created_at: 0,
        }
    }

    #[test]
    fn expiry_is_inclusive() {
        let m = meta(100);
        assert!(!m.is_expired_at(99));
        assert!(m.is_expired_at(100));
        assert!(m.is_expired_at(101));
        assert_eq!(m.ttl_secs(40), 60);
    }

    #[test]
    fn normalize_deactivates_exhausted_and_deleted() {
        let mut m = meta(100);
        m.views_left = 0;
        m.normalize();
        assert!(!m.is_active);

        let mut m = meta(100);
        m.is_deleted = true;
        m.normalize();
        assert!(!m.is_active);

        let mut m = meta(100);
        m.views_left = 9;
        m.normalize();
        assert_eq!(m.views_left, 3);
        assert!(m.is_active);
    }

    #[test]
    fn payload_kind_parses_case_insensitively() {
        assert_eq!(PayloadKind::parse("text"), Some(PayloadKind::Text));
        assert_eq!(PayloadKind::parse("IMAGE"), Some(PayloadKind::Image));
        assert_eq!(PayloadKind::parse("video"), None);
    }
}
