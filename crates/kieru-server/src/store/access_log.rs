use serde::{Deserialize, Serialize};

// ── Failure reasons ──────────────────────────────────────────────────────────

pub const REASON_NOT_FOUND: &str = "not found";
pub const REASON_DELETED: &str = "deleted";
pub const REASON_EXPIRED: &str = "expired";
pub const REASON_INACTIVE: &str = "inactive";
pub const REASON_EXHAUSTED: &str = "max views reached";
pub const REASON_INVALID_PASSWORD: &str = "invalid password";
pub const REASON_PAYLOAD_MISSING: &str = "payload missing";
pub const REASON_INTERNAL: &str = "internal error";

// ── Client metadata ──────────────────────────────────────────────────────────

/// What the transport layer knows about the caller of a redemption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMeta {
    pub ip_address: String,
    pub user_agent: Option<String>,
}

impl ClientMeta {
    pub fn new(ip_address: impl Into<String>, user_agent: Option<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent,
        }
    }
}

// ── DeviceType ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    Tablet,
    Desktop,
    Bot,
    Unknown,
}

impl DeviceType {
    /// Coarse classification from a `User-Agent` header.
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        let Some(ua) = user_agent else {
            return Self::Unknown;
        };
        let ua = ua.to_ascii_lowercase();
        let has = |needle: &str| ua.contains(needle);

        if has("bot") || has("crawler") || has("spider") || has("curl/") || has("wget/") {
            Self::Bot
        } else if has("ipad") || has("tablet") || (has("android") && !has("mobi")) {
            Self::Tablet
        } else if has("mobi") || has("iphone") || has("android") {
            Self::Mobile
        } else if has("windows") || has("macintosh") || has("x11") || has("linux") {
            Self::Desktop
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Tablet => "tablet",
            Self::Desktop => "desktop",
            Self::Bot => "bot",
            Self::Unknown => "unknown",
        }
    }
}

// ── AccessLogEntry ───────────────────────────────────────────────────────────

/// One redemption attempt. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub id: u64,
    pub secret_id: String,
    /// Unix timestamp (seconds) of the request.
    pub accessed_at: i64,
    pub ip_address: String,
    pub device_type: DeviceType,
    pub user_agent: Option<String>,
    pub was_successful: bool,
    pub failure_reason: Option<String>,
}

impl AccessLogEntry {
    pub fn new(
        secret_id: &str,
        accessed_at: i64,
        client: &ClientMeta,
        was_successful: bool,
        failure_reason: Option<&str>,
    ) -> Self {
        Self {
            id: 0, // allocated by store
            secret_id: secret_id.to_owned(),
            accessed_at,
            ip_address: client.ip_address.clone(),
            device_type: DeviceType::from_user_agent(client.user_agent.as_deref()),
            user_agent: client.user_agent.clone(),
            was_successful,
            failure_reason: failure_reason.map(str::to_owned),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_user_agents() {
        let cases = [
            (
                "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148",
                DeviceType::Mobile,
            ),
            (
                "Mozilla/5.0 (Linux; Android 14; Pixel 8) Mobile Safari/537.36",
                DeviceType::Mobile,
            ),
            (
                "Mozilla/5.0 (Linux; Android 13; SM-X700) Safari/537.36",
                DeviceType::Tablet,
            ),
            ("Mozilla/5.0 (iPad; CPU OS 16_0 like Mac OS X)", DeviceType::Tablet),
            (
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0",
                DeviceType::Desktop,
            ),
            ("curl/8.4.0", DeviceType::Bot),
            ("Googlebot/2.1 (+http://www.google.com/bot.html)", DeviceType::Bot),
            ("something-else", DeviceType::Unknown),
        ];
        for (ua, expected) in cases {
            assert_eq!(DeviceType::from_user_agent(Some(ua)), expected, "{ua}");
        }
        assert_eq!(DeviceType::from_user_agent(None), DeviceType::Unknown);
    }

    #[test]
    fn entry_copies_client_meta() {
        let client = ClientMeta::new("10.0.0.1", Some("curl/8.0".into()));
        let entry = AccessLogEntry::new("s1", 42, &client, false, Some(REASON_EXPIRED));
        assert_eq!(entry.id, 0);
        assert_eq!(entry.ip_address, "10.0.0.1");
        assert_eq!(entry.device_type, DeviceType::Bot);
        assert_eq!(entry.failure_reason.as_deref(), Some("expired"));
    }
}
