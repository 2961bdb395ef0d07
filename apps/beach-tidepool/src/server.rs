use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use serde::Serialize;
use tidepool_sync::{persist, SharedEngine, SnapshotStore, SyncEngine};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{ServerConfig, TlsPaths};
use crate::websocket::ws_handler;

pub struct AppState {
    pub engine: SharedEngine,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(engine: SharedEngine, metrics: Option<PrometheusHandle>) -> Self {
        Self { engine, metrics }
    }

    fn stats(&self) -> StatsResponse {
        let engine = self.engine.lock();
        let mut stats = StatsResponse::default();
        for room in engine.registry().rooms() {
            stats.rooms += 1;
            if room.state().is_some() {
                stats.rooms_with_state += 1;
            }
            stats.members += room.members().len();
            stats.open_members += room.members().iter().filter(|peer| peer.is_open()).count();
        }
        stats
    }
}

#[derive(Debug, Default, Serialize)]
pub struct StatsResponse {
    pub rooms: usize,
    pub rooms_with_state: usize,
    /// Attachments, counting duplicate joins and closed connections.
    pub members: usize,
    pub open_members: usize,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` over plain TCP until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let store = SnapshotStore::new(&config.snapshot_path);
    let registry = persist::restore(&store).await;
    gauge!("tidepool_rooms_active", registry.len() as f64);
    let engine: SharedEngine = Arc::new(Mutex::new(SyncEngine::with_registry(
        config.sync_config(),
        registry,
    )));

    let snapshotter =
        persist::spawn_snapshotter(engine.clone(), store.clone(), config.snapshot_interval);

    let state = Arc::new(AppState::new(engine.clone(), Some(metrics)));
    let router = build_router(state);

    match &config.tls {
        Some(tls) => serve_tls(&config, tls, router).await?,
        None => {
            let listener = TcpListener::bind(config.listen_addr)
                .await
                .context("failed to bind listener")?;
            info!("beach-tidepool listening on ws://{}", config.listen_addr);
            serve(listener, router, shutdown_signal())
                .await
                .context("server shutdown with error")?;
        }
    }

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; writing final snapshot"
    );
    persist::shutdown(snapshotter, &engine, &store).await;
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn serve_tls(config: &ServerConfig, tls: &TlsPaths, router: Router) -> Result<()> {
    let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
        .await
        .with_context(|| format!("failed to load TLS material from {}", tls.cert.display()))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let grace = config.shutdown_grace;
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_handle.graceful_shutdown(Some(grace));
    });

    info!("beach-tidepool listening on wss://{}", config.listen_addr);
    axum_server::bind_rustls(config.listen_addr, rustls)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("TLS server shutdown with error")
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
