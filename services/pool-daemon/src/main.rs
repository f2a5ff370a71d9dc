//! Account pool daemon
//!
//! Single-binary service that:
//! 1. Loads the pool document from a JSON file
//! 2. Ingests throttle and usage signals from agent hosts over HTTP
//! 3. Fails throttled sessions over to another account
//! 4. Reactivates throttled accounts once their window has passed
//! 5. Exposes an admin API, health, and Prometheus metrics

mod admin;
mod config;
mod error;
mod metrics;
mod signals;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use account_pool::{
    AccountRegistry, EventSink, FanoutSink, RecoveryPoller, SessionAssigner, SystemClock,
    ThrottleHandler, TracingSink, UsageListener,
};
use account_store::JsonFileStore;
use usage_store::{MemoryUsageStore, UsageStore};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::signals::{SignalState, build_signal_router};

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State for the health and metrics endpoints
#[derive(Clone)]
struct AppState {
    registry: Arc<AccountRegistry>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Every component the daemon wires together.
struct Components {
    app: AppState,
    admin: AdminState,
    signals: SignalState,
    poller: Arc<RecoveryPoller>,
}

/// Build the pool components over the given store and event sink.
fn build_components(
    registry: Arc<AccountRegistry>,
    usage: Arc<dyn UsageStore>,
    events: Arc<dyn EventSink>,
    config: &Config,
    prometheus: PrometheusHandle,
) -> Components {
    let throttle = Arc::new(ThrottleHandler::new(
        registry.clone(),
        usage.clone(),
        events.clone(),
    ));
    let listener = Arc::new(UsageListener::new(
        registry.clone(),
        usage,
        events.clone(),
        config.usage.session_suffix_markers.clone(),
    ));
    let assigner = Arc::new(SessionAssigner::new(registry.clone(), events.clone()));
    let poller = Arc::new(RecoveryPoller::new(
        registry.clone(),
        events,
        config.recovery.poll_interval(),
    ));

    Components {
        app: AppState {
            registry: registry.clone(),
            prometheus,
            started_at: Instant::now(),
        },
        admin: AdminState::new(registry, assigner, poller.clone()),
        signals: SignalState::new(throttle, listener),
        poller,
    }
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(components: &Components, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(components.app.clone())
        .merge(build_admin_router(components.admin.clone()))
        .merge(build_signal_router(components.signals.clone()))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
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

    info!("starting account-pool");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

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
        listen_addr = %config.server.listen_addr,
        store_path = %config.store.path.display(),
        poll_interval_secs = config.recovery.poll_interval_secs,
        "configuration loaded"
    );

    let store = JsonFileStore::open(config.store.path.clone())
        .await
        .with_context(|| format!("failed to open store at {}", config.store.path.display()))?;
    let registry = Arc::new(AccountRegistry::new(Arc::new(store), Arc::new(SystemClock)));
    let events: Arc<dyn EventSink> = Arc::new(FanoutSink::new(vec![
        Arc::new(TracingSink),
        Arc::new(metrics::MetricsSink),
    ]));

    let components = build_components(
        registry.clone(),
        Arc::new(MemoryUsageStore::new()),
        events,
        &config,
        prometheus_handle,
    );

    match registry.summary().await {
        Ok(summary) => {
            metrics::record_pool_summary(&summary);
            info!(
                accounts = summary.accounts_total,
                active = summary.accounts_active,
                throttled = summary.accounts_throttled,
                assignments = summary.assignments_total,
                "pool loaded"
            );
        }
        Err(e) => warn!(error = %e, "could not summarize pool at startup"),
    }

    components.poller.start().await;

    let app = build_router(&components, config.server.max_connections);
    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // No recovery pass may start while the server drains
    components.poller.stop();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: pool summary plus uptime.
///
/// 200 while at least one account is active, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();

    let (status_code, body) = match state.registry.summary().await {
        Ok(summary) => {
            metrics::record_pool_summary(&summary);
            let status = summary.status();
            let code = if status == "unhealthy" {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (
                code,
                serde_json::json!({
                    "status": status,
                    "uptime_seconds": uptime,
                    "pool": summary,
                }),
            )
        }
        Err(e) => {
            warn!(error = %e, "health check could not read pool");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "uptime_seconds": uptime,
                    "error": e.to_string(),
                }),
            )
        }
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
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
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use account_pool::{ManualClock, NewAccount};
    use account_store::{AccountStatus, MemoryStore};

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn test_components() -> (Components, Arc<AccountRegistry>) {
        let registry = Arc::new(AccountRegistry::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        ));
        let components = build_components(
            registry.clone(),
            Arc::new(MemoryUsageStore::new()),
            Arc::new(TracingSink),
            &Config::default(),
            test_prometheus_handle(),
        );
        (components, registry)
    }

    async fn add(registry: &AccountRegistry, name: &str) -> String {
        registry
            .add(NewAccount::new(
                name,
                format!("{name}@example.com"),
                format!("/tmp/{name}"),
            ))
            .await
            .unwrap()
            .id
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_empty_pool_is_unhealthy() {
        let (components, _) = test_components();
        let app = build_router(&components, 16);

        let (status, body) = get(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["pool"]["accounts_total"], 0);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn health_reports_healthy_and_degraded() {
        let (components, registry) = test_components();
        let a = add(&registry, "a").await;
        add(&registry, "b").await;

        let (status, body) = get(build_router(&components, 16), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["pool"]["accounts_active"], 2);

        registry
            .set_status(&a, AccountStatus::Throttled)
            .await
            .unwrap();
        let (status, body) = get(build_router(&components, 16), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["pool"]["accounts_throttled"], 1);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let (components, _) = test_components();
        let response = build_router(&components, 16)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn admin_and_signal_routes_are_mounted() {
        let (components, registry) = test_components();
        add(&registry, "a").await;

        let (status, body) = get(build_router(&components, 16), "/accounts").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["accounts"].as_array().unwrap().len(), 1);

        let response = build_router(&components, 16)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/signals/usage")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"sessionId":"unknown","usageStats":{}}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let (components, _) = test_components();
        let (status, _) = get(build_router(&components, 16), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn concurrency_limit_serves_sequential_requests() {
        let (components, _) = test_components();
        let app = build_router(&components, 1);

        for _ in 0..3 {
            let (status, _) = get(app.clone(), "/switch-config").await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poller_started_from_components_stops_cleanly() {
        let (components, _) = test_components();
        components.poller.start().await;
        assert!(components.poller.is_running());
        components.poller.stop();
        assert!(!components.poller.is_running());
    }
}
