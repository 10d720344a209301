//! Tavily API gateway
//!
//! Single-binary service that fronts the Tavily search/extract/crawl/map
//! API with a pool of weighted API keys:
//! 1. Requests enter through `/tools/call` and are shaped per operation
//! 2. The pool assigns a key by smooth weighted round-robin
//! 3. Failures are classified into retry/cooldown/disable policy per key
//! 4. Every call lands in the audit log through the buffered sink

mod admin;
mod config;
mod metrics;
mod tools;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use dispatch::{DispatchEngine, EngineConfig, HttpUpstream, LogSink, default_cost_fn};
use keypool::{ErrorKind, KeyPool};
use keystore::{KeyStore, NewKey, Operation};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

const USAGE_SYNC_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const LOG_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const QUOTA_ROLLOVER_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    engine: Arc<DispatchEngine>,
    search_defaults: Arc<Map<String, Value>>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with the tool surface and the admin surface.
fn build_router(state: AppState, admin: admin::AdminState) -> Router {
    Router::new()
        .route("/tools/list", get(tools_list_handler))
        .route("/tools/call", post(tools_call_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(admin::build_admin_router(admin))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting tavily-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.gateway.listen_addr,
        store_path = %config.gateway.store_path.display(),
        base_url = %config.upstream.base_url,
        max_concurrent = config.gateway.max_concurrent,
        "configuration loaded"
    );

    let store = Arc::new(
        KeyStore::load(config.gateway.store_path.clone())
            .await
            .map_err(|e| anyhow::anyhow!("failed to open key store: {e}"))?,
    );

    // Seed keys from the environment; duplicates of stored keys are skipped
    if !config.seed_keys.is_empty() {
        let seeds: Vec<NewKey> = config
            .seed_keys
            .iter()
            .map(|key| NewKey {
                key_value: key.expose().to_string(),
                display_name: None,
                weight: None,
                max_errors: None,
            })
            .collect();
        match store.import_keys(seeds).await {
            Ok(0) => {}
            Ok(added) => info!(added, "seed keys imported"),
            Err(e) => warn!(error = %e, "seed key import failed"),
        }
    }

    let pool = Arc::new(KeyPool::new(store.clone()).await);
    if pool.active_count().await == 0 {
        warn!("no active keys in the pool, calls will fail until keys are added");
    }

    let upstream = Arc::new(HttpUpstream::new(
        reqwest::Client::new(),
        config.upstream.base_url.clone(),
        Duration::from_secs(config.upstream.timeout_secs),
    ));
    let sink = LogSink::new(
        store.clone(),
        config.gateway.log_flush_threshold,
        Duration::from_secs(config.gateway.log_flush_interval_secs),
    );
    let engine = Arc::new(DispatchEngine::new(
        pool.clone(),
        upstream.clone(),
        sink.clone(),
        default_cost_fn(),
        EngineConfig {
            max_concurrent: config.gateway.max_concurrent,
            retry: config.retry.to_retry_config(),
        },
    ));

    // A persisted admin override wins over the file value
    if let Some(stored) = store.get_config("max_concurrent").await
        && let Ok(limit) = stored.parse::<usize>()
        && limit > 0
    {
        engine.set_max_concurrent(limit).await;
    }

    dispatch::tasks::spawn_usage_sync_task(pool.clone(), upstream.clone(), USAGE_SYNC_INTERVAL);
    dispatch::tasks::spawn_log_cleanup_task(
        store.clone(),
        LOG_CLEANUP_INTERVAL,
        config.gateway.log_retention_days,
    );
    dispatch::tasks::spawn_quota_rollover_task(pool.clone(), QUOTA_ROLLOVER_INTERVAL);

    let state = AppState {
        engine: engine.clone(),
        search_defaults: Arc::new(config.search_defaults.clone()),
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let admin_state = admin::AdminState::new(pool.clone(), engine.clone());
    let app = build_router(state, admin_state);

    let listener = TcpListener::bind(config.gateway.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.gateway.listen_addr))?;
    info!(addr = %config.gateway.listen_addr, "accepting requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The buffered sink may still hold audit entries
    sink.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// GET /tools/list — the operation catalog.
async fn tools_list_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        json!({ "tools": tools::catalog() }).to_string(),
    )
}

/// Request body for /tools/call.
#[derive(Deserialize)]
struct CallRequest {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// POST /tools/call — shape the arguments and dispatch through the pool.
async fn tools_call_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<CallRequest>,
) -> impl IntoResponse {
    let Some(operation) = Operation::parse(&body.name) else {
        return (
            StatusCode::NOT_FOUND,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            json!({ "error": format!("unknown tool: {}", body.name) }).to_string(),
        );
    };

    let params = tools::shape(operation, &body.arguments, &state.search_defaults);
    match state.engine.call(operation, params).await {
        Ok(result) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            json!({ "result": result }).to_string(),
        ),
        Err(e) => (
            error_status(&e),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            json!({ "error": e.to_string(), "kind": e.label() }).to_string(),
        ),
    }
}

/// Map a terminal dispatch error onto the status the caller sees.
fn error_status(error: &dispatch::Error) -> StatusCode {
    match error {
        dispatch::Error::NoAvailableKeys => StatusCode::SERVICE_UNAVAILABLE,
        dispatch::Error::RetriesExhausted { .. } => StatusCode::BAD_GATEWAY,
        dispatch::Error::Upstream { kind, .. } => match kind {
            ErrorKind::Client => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_GATEWAY,
        },
        dispatch::Error::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        dispatch::Error::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /health — pool summary. 200 while at least one key is active,
/// 503 once the pool is fully parked.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.engine.pool().health().await;
    let active = pool["active"].as_u64().unwrap_or(0);
    let (status_code, status) = if active > 0 {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        json!({
            "status": status,
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "pool": pool,
        })
        .to_string(),
    )
}

/// Prometheus metrics endpoint — returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
