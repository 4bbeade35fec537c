use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::cache::window_key;
use crate::identity::Identity;
use crate::ratelimit::RateLimitPolicy;
use crate::store::ClientMeta;
use crate::AppState;

/// Everything the transport knows about the caller, attached to each request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub identity: Option<Identity>,
    pub ip: String,
    pub user_agent: Option<String>,
}

impl Caller {
    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            identity: None,
            ip: ip.into(),
            user_agent: None,
        }
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.subject_id.as_str())
    }

    /// Subject id for authenticated callers, client IP otherwise.
    pub fn identifier(&self) -> &str {
        self.subject_id().unwrap_or(&self.ip)
    }

    pub fn client_meta(&self) -> ClientMeta {
        ClientMeta::new(self.ip.clone(), self.user_agent.clone())
    }
}

/// Client IP as seen through proxies: `CF-Connecting-IP`, then the first
/// `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, addr: Option<SocketAddr>) -> String {
    if let Some(cf) = header_str(headers, "cf-connecting-ip") {
        return cf.to_owned();
    }
    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return real_ip.to_owned();
    }
    addr.map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Axum middleware that resolves the optional `Authorization: Bearer <token>`
/// into a [`Caller`] extension. No token means anonymous; a rejected token is
/// 401, and repeated rejections from one IP lock that IP.
pub async fn resolve_caller(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let headers = request.headers();
    let ip = client_ip(headers, addr);
    let user_agent = header_str(headers, "user-agent").map(str::to_owned);
    let token = header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_owned());

    let identity = match token {
        None => None,
        Some(token) => {
            // Route limits key authenticated callers by subject, so token
            // guessing is throttled here, per IP, before verification.
            if state.limiter.is_locked(&ip).await {
                warn!(ip = %ip, "bearer token from locked address refused");
                return too_many_requests("temporarily locked, try again later".into());
            }
            let verified = match state.identity.as_ref() {
                Some(provider) => provider.verify(&token).await,
                None => Ok(None),
            };
            match verified {
                Ok(Some(identity)) => Some(identity),
                Ok(None) => return rejected_token(&state, &ip).await,
                Err(e) => {
                    warn!(error = %e, "identity provider unavailable");
                    return (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(json!({"error": "identity provider unavailable"})),
                    )
                        .into_response();
                }
            }
        }
    };

    request.extensions_mut().insert(Caller {
        identity,
        ip,
        user_agent,
    });
    next.run(request).await
}

/// Count a refused token against the client IP, locking the IP once the
/// window is exceeded.
async fn rejected_token(state: &AppState, ip: &str) -> Response {
    let policy = RateLimitPolicy::REJECTED_TOKEN;
    let key = window_key(policy.scope.as_str(), "AUTH", "bearer", ip);
    if state
        .limiter
        .try_consume(&key, policy.limit, policy.window())
        .await
    {
        return unauthorized();
    }
    state.limiter.lock(ip, policy.lock_minutes).await;
    warn!(ip = %ip, lock_minutes = policy.lock_minutes, "repeated rejected tokens, address locked");
    too_many_requests(format!(
        "too many requests, locked for {} minutes",
        policy.lock_minutes
    ))
}

fn too_many_requests(message: String) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"error": message})),
    )
        .into_response()
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}
