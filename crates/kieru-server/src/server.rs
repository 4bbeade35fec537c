use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{delete, get, post, MethodRouter},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::resolve_caller,
    cache::{views::DEFAULT_WRITE_BEHIND_QUEUE, Cache, MemoryCache, DEFAULT_CACHE_TIMEOUT},
    handlers::{
        access_secret, create_secret, delete_secret, health, list_secrets, secret_logs,
        update_password, validate_secret,
    },
    identity::{IdentityProvider, RemoteIdentityProvider, DEFAULT_IDENTITY_CACHE_TTL},
    log_sink::{AccessLogSink, DEFAULT_LOG_QUEUE, DEFAULT_LOG_WRITERS},
    plans::StaticPlanProvider,
    ratelimit::{enforce, RateLimitPolicy, RateLimiter, RouteLimit},
    reaper::{spawn_reaper, DEFAULT_REAPER_BATCH, DEFAULT_REAPER_HARD_CAP, DEFAULT_REAPER_INTERVAL},
    store::{SecretStore, Store},
    AppState,
};

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub cors_origins: Option<String>,
    /// Token verification endpoint. Without one, bearer tokens are refused.
    pub identity_url: Option<String>,
    pub reaper_interval: Duration,
    pub reaper_batch: usize,
    pub reaper_hard_cap: usize,
    /// Upper bound on any single cache call.
    pub cache_timeout: Duration,
    pub log_queue: usize,
    pub log_writers: usize,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("KIERU_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("KIERU_PORT").unwrap_or(8080),
            data_dir: std::env::var("KIERU_DATA_DIR").ok().map(PathBuf::from),
            cors_origins: std::env::var("KIERU_CORS_ORIGINS").ok(),
            identity_url: std::env::var("KIERU_IDENTITY_URL").ok(),
            reaper_interval: env_parse("KIERU_REAPER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REAPER_INTERVAL),
            reaper_batch: env_parse("KIERU_REAPER_BATCH").unwrap_or(DEFAULT_REAPER_BATCH),
            reaper_hard_cap: env_parse("KIERU_REAPER_HARD_CAP").unwrap_or(DEFAULT_REAPER_HARD_CAP),
            cache_timeout: env_parse("KIERU_CACHE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CACHE_TIMEOUT),
            log_queue: env_parse("KIERU_LOG_QUEUE").unwrap_or(DEFAULT_LOG_QUEUE),
            log_writers: env_parse("KIERU_LOG_WRITERS").unwrap_or(DEFAULT_LOG_WRITERS),
        }
    }
}

/// Resolve and create the data directory: explicit path, then
/// `KIERU_DATA_DIR`, then the platform default.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

/// Attach a rate limit policy to one route.
fn limited(
    route: MethodRouter<AppState>,
    limiter: &RateLimiter,
    policy: RateLimitPolicy,
) -> MethodRouter<AppState> {
    route.layer(middleware::from_fn_with_state(
        RouteLimit::new(limiter.clone(), policy),
        enforce,
    ))
}

/// All routes with their rate limits and caller resolution. CORS and
/// request tracing are added by [`run`].
pub fn router(state: AppState) -> Router {
    let limiter = state.limiter.clone();

    let secrets = Router::new()
        .route(
            "/api/secrets",
            limited(post(create_secret), &limiter, RateLimitPolicy::CREATE_SECRET),
        )
        .route(
            "/api/secrets/{id}",
            limited(delete(delete_secret), &limiter, RateLimitPolicy::DELETE_SECRET),
        )
        .route(
            "/api/secrets/{id}/access",
            limited(post(access_secret), &limiter, RateLimitPolicy::ACCESS_SECRET),
        )
        .route(
            "/api/secrets/{id}/validation",
            limited(get(validate_secret), &limiter, RateLimitPolicy::VALIDATE_SECRET),
        )
        .route(
            "/api/secrets/{id}/password",
            limited(post(update_password), &limiter, RateLimitPolicy::UPDATE_PASSWORD),
        );

    let dashboard = Router::new()
        .route(
            "/api/dashboard/secrets",
            limited(get(list_secrets), &limiter, RateLimitPolicy::LIST_SECRETS),
        )
        .route(
            "/api/dashboard/secrets/{id}/logs",
            limited(get(secret_logs), &limiter, RateLimitPolicy::SECRET_LOGS),
        );

    let api = Router::new()
        .merge(secrets)
        .merge(dashboard)
        .layer(middleware::from_fn_with_state(state.clone(), resolve_caller));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let db_path = data_dir.join("kieru.db");
    let store: Arc<dyn SecretStore> = Arc::new(Store::open(&db_path).context("open store")?);

    let memory = Arc::new(MemoryCache::new());
    memory.clone().spawn_purge(CACHE_PURGE_INTERVAL);
    let cache = Cache::new(memory, cfg.cache_timeout);

    let identity: Option<Arc<dyn IdentityProvider>> = match cfg.identity_url {
        Some(ref url) => {
            info!(url = %url, "verifying bearer tokens remotely");
            let provider = Arc::new(RemoteIdentityProvider::new(
                url.clone(),
                DEFAULT_IDENTITY_CACHE_TTL,
            )?);
            provider.clone().spawn_purge(CACHE_PURGE_INTERVAL);
            Some(provider as Arc<dyn IdentityProvider>)
        }
        None => {
            warn!("KIERU_IDENTITY_URL not set: only anonymous callers will be served");
            None
        }
    };

    let sink = AccessLogSink::start(store.clone(), cfg.log_queue, cfg.log_writers);
    let state = AppState::new(
        store.clone(),
        cache,
        Arc::new(StaticPlanProvider::default()),
        identity,
        sink,
        DEFAULT_WRITE_BEHIND_QUEUE,
    );

    spawn_reaper(
        store,
        cfg.reaper_interval,
        cfg.reaper_batch,
        cfg.reaper_hard_cap,
    );

    let app = router(state.clone())
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "kieru server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    state.views.flush().await;
    state.sink.wait_idle().await;
    info!(dropped_log_entries = state.sink.dropped(), "shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested, draining");
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
