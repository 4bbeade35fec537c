use axum::{
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use super::{RateLimitPolicy, RateLimiter, Scope};
use crate::auth::{client_ip, Caller};
use crate::cache::window_key;

/// Middleware state: the shared limiter plus the policy of one route.
#[derive(Clone)]
pub struct RouteLimit {
    pub limiter: RateLimiter,
    pub policy: RateLimitPolicy,
}

impl RouteLimit {
    pub fn new(limiter: RateLimiter, policy: RateLimitPolicy) -> Self {
        Self { limiter, policy }
    }
}

/// Axum middleware enforcing a [`RateLimitPolicy`]. Locked identifiers are
/// refused outright; exceeding the window locks the identifier.
pub async fn enforce(State(limit): State<RouteLimit>, request: Request, next: Next) -> Response {
    let caller = request
        .extensions()
        .get::<Caller>()
        .cloned()
        .unwrap_or_else(|| Caller::anonymous(client_ip(request.headers(), None)));
    let identifier = caller.identifier().to_owned();

    if limit.limiter.is_locked(&identifier).await {
        warn!(identifier = %identifier, "request from locked identifier refused");
        return too_many_requests("temporarily locked, try again later".into());
    }

    let policy = limit.policy;
    let scoped = match policy.scope {
        Scope::User => identifier.as_str(),
        Scope::Ip | Scope::Anonymous => caller.ip.as_str(),
        Scope::Global => "global",
    };
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let key = window_key(
        policy.scope.as_str(),
        request.method().as_str(),
        &route,
        scoped,
    );

    if !limit
        .limiter
        .try_consume(&key, policy.limit, policy.window())
        .await
    {
        limit.limiter.lock(&identifier, policy.lock_minutes).await;
        warn!(
            identifier = %identifier,
            route = %route,
            lock_minutes = policy.lock_minutes,
            "rate limit exceeded, identifier locked"
        );
        return too_many_requests(format!(
            "too many requests, locked for {} minutes",
            policy.lock_minutes
        ));
    }

    next.run(request).await
}

fn too_many_requests(message: String) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": message })),
    )
        .into_response()
}
