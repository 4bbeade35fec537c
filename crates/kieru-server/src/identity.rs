//! Bearer-token verification against a remote identity service.
//!
//! Positive answers are cached briefly, keyed by a SHA-256 digest of the
//! token, so authenticated bursts do not each cost an HTTP round trip.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDENTITY_CACHE_TTL: Duration = Duration::from_secs(60);

/// Who the caller is, as vouched for by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    /// Sign-in method reported by the provider, e.g. `google.com` or `password`.
    pub provider: String,
    /// Subscription plan name, if the provider knows one.
    pub plan: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` means the token was checked and rejected.
    /// `Err` means the provider could not give an answer.
    async fn verify(&self, token: &str) -> Result<Option<Identity>>;
}

/// JSON body returned by the verification endpoint.
#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
    subject_id: Option<String>,
    display_name: Option<String>,
    email: Option<String>,
    provider: Option<String>,
    plan: Option<String>,
}

impl VerifyResponse {
    fn into_identity(self) -> Option<Identity> {
        if !self.valid {
            return None;
        }
        let subject_id = self.subject_id.filter(|s| !s.is_empty())?;
        Some(Identity {
            subject_id,
            display_name: self.display_name,
            email: self.email,
            provider: self.provider.unwrap_or_else(|| "unknown".into()),
            plan: self.plan,
        })
    }
}

#[derive(Debug, Clone)]
struct CachedIdentity {
    identity: Identity,
    checked_at: Instant,
}

/// POSTs `{"token": ...}` to a configured URL.
pub struct RemoteIdentityProvider {
    client: reqwest::Client,
    url: String,
    cache: DashMap<String, CachedIdentity>,
    cache_ttl: Duration,
}

impl RemoteIdentityProvider {
    pub fn new(url: impl Into<String>, cache_ttl: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
            cache: DashMap::new(),
            cache_ttl,
        })
    }

    /// Drop cached identities older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.cache.len();
        let ttl = self.cache_ttl;
        self.cache.retain(|_, c| c.checked_at.elapsed() < ttl);
        before.saturating_sub(self.cache.len())
    }

    /// Periodically purge stale identities so rotated tokens do not accumulate.
    pub fn spawn_purge(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    debug!(purged, "purged stale identities");
                }
            }
        });
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.len()
    }

    async fn verify_remote(&self, token: &str) -> Result<Option<Identity>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .context("identity provider request")?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(None);
        }
        if !status.is_success() {
            anyhow::bail!("identity provider returned {status}");
        }
        let body: VerifyResponse = resp.json().await.context("decode identity response")?;
        Ok(body.into_identity())
    }
}

#[async_trait]
impl IdentityProvider for RemoteIdentityProvider {
    async fn verify(&self, token: &str) -> Result<Option<Identity>> {
        let cache_key = token_digest(token);

        let fresh = self
            .cache
            .get(&cache_key)
            .filter(|hit| hit.checked_at.elapsed() < self.cache_ttl)
            .map(|hit| hit.identity.clone());
        if fresh.is_some() {
            return Ok(fresh);
        }
        self.cache.remove(&cache_key);

        let verified = self.verify_remote(token).await?;
        match verified {
            Some(ref identity) => {
                debug!(subject_id = %identity.subject_id, provider = %identity.provider, "token verified");
                self.purge_expired();
                self.cache.insert(
                    cache_key,
                    CachedIdentity {
                        identity: identity.clone(),
                        checked_at: Instant::now(),
                    },
                );
            }
            None => warn!("identity provider rejected bearer token"),
        }
        Ok(verified)
    }
}

fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(mock: &MockServer, ttl: Duration) -> RemoteIdentityProvider {
        RemoteIdentityProvider::new(format!("{}/verify", mock.uri()), ttl).unwrap()
    }

    #[tokio::test]
    async fn valid_token_maps_to_identity_and_is_cached() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .and(body_json(serde_json::json!({ "token": "tok-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "valid": true,
                "subject_id": "user-42",
                "display_name": "Ada",
                "email": "ada@example.com",
                "provider": "google.com",
                "plan": "challenger"
            })))
            .expect(1)
            .mount(&mock)
            .await;

        let p = provider(&mock, Duration::from_secs(60));
        let identity = p.verify("tok-1").await.unwrap().unwrap();
        assert_eq!(identity.subject_id, "user-42");
        assert_eq!(identity.email.as_deref(), Some("ada@example.com"));
        assert_eq!(identity.plan.as_deref(), Some("challenger"));

        // Served from cache; the mock's expect(1) verifies on drop.
        assert_eq!(p.verify("tok-1").await.unwrap(), Some(identity));
    }

    #[tokio::test]
    async fn invalid_token_is_rejected() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "valid": false
            })))
            .mount(&mock)
            .await;

        let p = provider(&mock, Duration::from_secs(60));
        assert_eq!(p.verify("bad").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unauthorized_status_is_rejection_not_error() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock)
            .await;

        let p = provider(&mock, Duration::from_secs(60));
        assert_eq!(p.verify("bad").await.unwrap(), None);
    }

    #[tokio::test]
    async fn server_error_is_error() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock)
            .await;

        let p = provider(&mock, Duration::from_secs(60));
        assert!(p.verify("tok").await.is_err());
    }

    #[tokio::test]
    async fn unreachable_is_error() {
        let p = RemoteIdentityProvider::new("http://127.0.0.1:1/verify", Duration::from_secs(60))
            .unwrap();
        assert!(p.verify("tok").await.is_err());
    }

    #[tokio::test]
    async fn stale_cache_is_revalidated() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "valid": true,
                "subject_id": "user-1",
                "provider": "password"
            })))
            .expect(2)
            .mount(&mock)
            .await;

        let p = provider(&mock, Duration::ZERO);
        p.verify("tok").await.unwrap();
        p.verify("tok").await.unwrap();
    }

    #[tokio::test]
    async fn rotated_tokens_do_not_accumulate() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "valid": true,
                "subject_id": "user-1",
                "provider": "password"
            })))
            .mount(&mock)
            .await;

        let p = provider(&mock, Duration::from_millis(10));
        for i in 0..200 {
            p.verify(&format!("tok-{i}")).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        p.verify("tok-new").await.unwrap();
        assert_eq!(p.cached_len(), 1);
    }

    #[tokio::test]
    async fn idle_cache_is_purged_on_a_timer() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "valid": true,
                "subject_id": "user-1",
                "provider": "password"
            })))
            .mount(&mock)
            .await;

        let p = Arc::new(provider(&mock, Duration::from_millis(200)));
        p.verify("a").await.unwrap();
        p.verify("b").await.unwrap();
        assert!(p.cached_len() > 0);

        // No further verify calls: only the timer can empty the cache.
        p.clone().spawn_purge(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(p.cached_len(), 0);
    }

    #[test]
    fn digest_is_stable_hex() {
        let d = token_digest("abc");
        assert_eq!(d.len(), 64);
        assert_eq!(d, token_digest("abc"));
        assert_ne!(d, token_digest("abd"));
    }
}
