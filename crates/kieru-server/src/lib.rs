pub mod auth;
pub mod cache;
pub mod dirs;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod identity;
pub mod log_sink;
pub mod plans;
pub mod ratelimit;
pub mod reaper;
pub mod server;
pub mod service;
pub mod store;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: gate::AccessGate,
    pub secrets: service::SecretService,
    pub limiter: ratelimit::RateLimiter,
    pub views: cache::ViewCounter,
    pub sink: log_sink::AccessLogSink,
    /// Bearer tokens are refused when no provider is configured.
    pub identity: Option<Arc<dyn identity::IdentityProvider>>,
}

impl AppState {
    /// Wire the components over one store and one cache.
    pub fn new(
        store: Arc<dyn store::SecretStore>,
        cache: cache::Cache,
        plans: Arc<dyn plans::PlanProvider>,
        identity: Option<Arc<dyn identity::IdentityProvider>>,
        sink: log_sink::AccessLogSink,
        write_behind_queue: usize,
    ) -> Self {
        let views = cache::ViewCounter::new(cache.clone(), store.clone(), write_behind_queue);
        let limiter = ratelimit::RateLimiter::new(cache);
        let gate = gate::AccessGate::new(store.clone(), views.clone(), sink.clone());
        let secrets = service::SecretService::new(store, views.clone(), limiter.clone(), plans);
        Self {
            gate,
            secrets,
            limiter,
            views,
            sink,
            identity,
        }
    }
}

pub use server::{resolve_data_dir, router, run, ServerConfig};
