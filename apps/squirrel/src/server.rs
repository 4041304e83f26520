use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tracing::{debug, error, info, warn};

use crate::config::{Domain, RelayConfig, ServerConfig};
use crate::connection::{write_pump, Connection};
use crate::hub::{Hub, HubHandle};
use crate::registry::ConnectionSnapshot;

pub struct AppState {
    hub: HubHandle,
    relay: Arc<RelayConfig>,
    domain: Domain,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        hub: HubHandle,
        relay: RelayConfig,
        domain: Domain,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            hub,
            relay: Arc::new(relay),
            domain,
            metrics,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    connections: usize,
    broadcasters: usize,
    subscribers: usize,
    registry: Vec<ConnectionSnapshot>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/client/", get(empty_client_handler))
        .route("/client/:client_id", get(client_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Binds the listener, serves until ctrl-c, then waits out the grace period.
pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let (hub, hub_task) = Hub::spawn(config.relay.hub_capacity);
    let state = Arc::new(AppState::new(
        hub,
        config.relay.clone(),
        config.domain.clone(),
        metrics,
    ));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(
        listen_addr = %config.listen_addr,
        websocket_url = %config.domain.websocket_url(),
        "squirrel relay listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs_f64(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    hub_task.abort();
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    wait_for_shutdown(signal::ctrl_c()).await;
}

/// Resolves once `signal` fires. A signal handler that cannot be installed
/// is logged and the server keeps running.
async fn wait_for_shutdown<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = signal.await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.snapshot().await {
        Ok(registry) => {
            let broadcasters = registry.iter().filter(|c| c.role.is_broadcaster()).count();
            let subscribers = registry.iter().filter(|c| c.role.is_subscriber()).count();
            Json(StatsResponse {
                connections: registry.len(),
                broadcasters,
                subscribers,
                registry,
            })
            .into_response()
        }
        Err(err) => {
            error!(error = %err, "stats unavailable");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn empty_client_handler() -> Response {
    (StatusCode::BAD_REQUEST, "client id cannot be empty").into_response()
}

/// Tells a would-be subscriber whether the broadcaster it was linked to is
/// online and where to connect.
async fn client_handler(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Response {
    if client_id.trim().is_empty() {
        return empty_client_handler().await;
    }
    match state.hub.contains(client_id.clone()).await {
        Ok(true) => Json(json!({
            "client_id": client_id,
            "websocket_url": state.domain.websocket_url(),
        }))
        .into_response(),
        Ok(false) => {
            debug!(client_id = %client_id, "subscriber link for unknown client");
            (StatusCode::NOT_FOUND, "client not found").into_response()
        }
        Err(err) => {
            error!(error = %err, "client lookup unavailable");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(state.relay.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Registers the upgraded socket and runs its two pumps until the read side
/// ends. The write side finishes on its own once the hub closes its queue.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (connection, outbound) =
        match Connection::accept(state.hub.clone(), state.relay.clone()).await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(error = %err, "failed to register connection");
                return;
            }
        };
    let connection_id = connection.state().id.clone();
    counter!("squirrel_connections_total", 1);
    info!(connection_id = %connection_id, "websocket connection established");

    let (sink, stream) = socket.split();
    let writer_id = connection_id.clone();
    let relay = state.relay.clone();
    tokio::spawn(async move {
        if let Err(err) = write_pump(outbound, sink, relay).await {
            debug!(connection_id = %writer_id, error = %err, "write pump ended with error");
        }
    });

    match connection.read_pump(stream).await {
        Ok(()) => info!(connection_id = %connection_id, "websocket connection closed"),
        Err(err) => {
            counter!(
                "squirrel_connections_dropped_total",
                1,
                "reason" => err.metric_label()
            );
            warn!(connection_id = %connection_id, error = %err, "websocket connection dropped");
        }
    }
}
