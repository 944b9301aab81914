//! Connection handlers for Huddle server.
//!
//! This module handles the connection lifecycle: upgrade, the per-session
//! receive loop and cleanup.

use crate::config::Config;
use crate::metrics::{self, SessionMetricsGuard};
use crate::storage;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use huddle_core::Hub;
use huddle_transport::{Connection, TransportError, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The relay hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(hub: Arc<Hub>, config: Config) -> Self {
        Self { hub, config }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if storage cannot be opened or the listener cannot bind.
pub async fn run_server(config: Config) -> Result<()> {
    let store = storage::open_store(&config.storage).await?;
    let hub = Hub::start(config.hub_config(), store).await;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let state = Arc::new(AppState::new(Arc::clone(&hub), config));
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    hub.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": stats.session_count,
        "channels": stats.channel_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    if state.hub.stats().session_count >= state.config.limits.max_connections {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached, rejecting upgrade"
        );
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr.to_string());
    let ws_config = state.config.websocket_config();
    let hub = Arc::clone(&state.hub);

    ws.max_message_size(ws_config.max_message_size)
        .on_upgrade(move |socket| {
            let connection = WebSocketConnection::new(socket, remote_addr, ws_config);
            serve_connection(hub, Box::new(connection))
        })
}

/// Run a session over an accepted connection until it closes or fails.
///
/// Inbound envelopes are dispatched in order. Malformed frames and rejected
/// envelopes are dropped; transport failures, on either half, end the session.
pub async fn serve_connection(hub: Arc<Hub>, connection: Box<dyn Connection>) {
    let _metrics_guard = SessionMetricsGuard::new();
    let session_id = connection.id().clone();
    let remote_addr = connection.remote_addr();
    let (sink, mut source) = connection.split();
    let session = hub.register(session_id.clone(), sink, remote_addr);

    debug!(session = %session_id, remote = ?session.remote_addr(), "Session opened");

    loop {
        let next = tokio::select! {
            biased;

            () = session.closed() => {
                debug!(session = %session_id, "Session marked dead");
                break;
            }
            next = source.recv() => next,
        };

        match next {
            Ok(Some(envelope)) => {
                let kind = envelope.kind();
                metrics::record_envelope(kind, "inbound");

                let start = Instant::now();
                let result = hub.dispatch(&session, envelope).await;
                metrics::record_dispatch(start.elapsed().as_secs_f64());

                match result {
                    Ok(()) => {
                        if kind == "join_channel" {
                            metrics::record_join();
                            metrics::set_active_channels(hub.stats().channel_count);
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        warn!(session = %session_id, kind, error = %e, "Session failed");
                        metrics::record_error(e.kind());
                        break;
                    }
                    Err(e) => {
                        warn!(session = %session_id, kind, error = %e, "Dropped envelope");
                        metrics::record_error(e.kind());
                    }
                }
            }
            Ok(None) => {
                debug!(session = %session_id, "Connection closed by peer");
                break;
            }
            Err(TransportError::Protocol(e)) => {
                warn!(session = %session_id, error = %e, "Dropped malformed frame");
                metrics::record_error("protocol");
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "Receive failed");
                metrics::record_error("transport");
                break;
            }
        }
    }

    let left = hub.disconnect(&session_id).await;
    debug!(session = %session_id, channels = ?left, "Session closed");
}
