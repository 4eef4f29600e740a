use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    handlers::{create_secret, get_secret, health},
    lifecycle::{Lifecycle, DEFAULT_STORE_TIMEOUT},
    link,
    store::{self, short_id, StoreBackend},
    AppState,
};

/// Largest request body accepted. Leaves headroom over the ciphertext limit
/// for the JSON envelope.
pub const MAX_BODY_BYTES: usize = 256 * 1024;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `memory`, `redb` or `redis` ($WHISPER_STORE). Unset picks redis when a
    /// URL is configured and memory otherwise.
    pub store: Option<String>,
    pub redis_url: Option<String>,
    /// Directory for `whisper.db` when the redb store is selected.
    pub data_dir: Option<PathBuf>,
    pub sweep_interval: Duration,
    pub store_timeout: Duration,
    /// Comma-separated allow list, or `*`. Unset means same-origin only.
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("WHISPER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("WHISPER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            store: std::env::var("WHISPER_STORE").ok(),
            redis_url: std::env::var("WHISPER_REDIS_URL").ok(),
            data_dir: std::env::var("WHISPER_DATA_DIR").ok().map(PathBuf::from),
            sweep_interval: Duration::from_secs(
                std::env::var("WHISPER_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            store_timeout: std::env::var("WHISPER_STORE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_STORE_TIMEOUT),
            cors_origins: std::env::var("WHISPER_CORS_ORIGINS").ok(),
        }
    }
}

impl ServerConfig {
    /// Decide which backend to open. Done once, at startup.
    pub fn resolve_backend(&self) -> Result<StoreBackend> {
        let kind = match self.store.as_deref() {
            Some(kind) => kind,
            None if self.redis_url.is_some() => "redis",
            None => "memory",
        };

        match kind {
            "memory" => Ok(StoreBackend::Memory),
            "redb" => {
                let dir = resolve_data_dir(self.data_dir.as_ref())?;
                Ok(StoreBackend::Db {
                    path: dir.join("whisper.db"),
                })
            }
            "redis" => {
                let url = self
                    .redis_url
                    .clone()
                    .context("WHISPER_REDIS_URL is required for the redis store")?;
                Ok(StoreBackend::Redis { url })
            }
            other => anyhow::bail!("unknown WHISPER_STORE {other:?} (expected memory, redb or redis)"),
        }
    }
}

pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let backend = cfg.resolve_backend()?;
    let store = backend.open().await?;
    info!(backend = store.backend(), "opened secret store");

    let sweep = store::spawn_sweep(store.clone(), cfg.sweep_interval);

    let state = AppState {
        lifecycle: Lifecycle::new(store, cfg.store_timeout),
    };
    let app = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "whisper server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    sweep.stop().await;
    info!("shutdown complete");
    served
}

/// Build the application router. Public so tests can drive it in-process.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    let routes = Router::new()
        .route("/health", get(health))
        .route("/secret", post(create_secret))
        .route("/secret/{id}", get(get_secret));

    Router::new()
        .merge(routes.clone())
        .nest("/api", routes)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http().make_span_with(|req: &Request| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                path = %redact_path(req.uri().path()),
            )
        }))
}

/// Shorten secret ids in a request path so full ids never reach the logs.
fn redact_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if link::is_valid_id(segment) {
                format!("{}…", short_id(segment))
            } else {
                segment.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    let Some(list) = origins.map(str::trim).filter(|o| !o.is_empty()) else {
        return cors;
    };
    let entries: Vec<&str> = list.split(',').map(str::trim).collect();

    // tower-http refuses a wildcard inside an explicit list.
    if entries.contains(&"*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = entries
        .into_iter()
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| entry.parse().ok())
        .collect();
    cors.allow_origin(origins)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl+c");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}
