//! Axum HTTP + WebSocket front door.
//!
//! Routes every upgraded socket on `/ws` to whatever server generation the
//! [`ContinuityStore`] currently holds, and serves `/health` and `/metrics`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::PeerInfo;
use crate::continuity::ContinuityStore;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_CONNECTIONS_REJECTED_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{SessionSettings, run_ws_session};

/// Why the listener could not start.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The bind address was unavailable.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested `host:port`.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Listener I/O failure.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Holder of the current server generation.
    pub store: Arc<dyn ContinuityStore>,
    /// Transport configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the gateway started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            ping_interval: Duration::from_secs(self.config.heartbeat_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(self.config.heartbeat_timeout_secs),
            send_buffer: self.config.send_buffer,
        }
    }
}

/// The HTTP listener in front of the server generations.
pub struct Gateway {
    config: Arc<ServerConfig>,
    store: Arc<dyn ContinuityStore>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl Gateway {
    /// Create a gateway routing sockets to the generation held by `store`.
    pub fn new(config: ServerConfig, store: Arc<dyn ContinuityStore>) -> Self {
        Self {
            config: Arc::new(config),
            store,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        info!(addr = %local_addr, "tether server listening");
        let handle = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
            if let Err(e) = result {
                error!(error = %e, "server stopped with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the continuity store.
    pub fn store(&self) -> &Arc<dyn ContinuityStore> {
        &self.store
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let server = state.store.current();
    Json(health::health_check(state.start_time, server.as_deref()))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /ws: upgrade and hand the socket to the current generation.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Some(server) = state.store.current() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no server generation").into_response();
    };
    if server.connection_count() >= state.config.max_connections {
        warn!(%remote, limit = state.config.max_connections, "connection limit reached, refusing upgrade");
        counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let mut peer = PeerInfo::from_addr(remote);
    for (key, value) in params {
        peer = peer.with_field(key, value);
    }
    if let Some(agent) = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        peer = peer.with_field("user-agent", agent);
    }

    let settings = state.session_settings();
    let token = state.shutdown.token();
    let store = Arc::clone(&state.store);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            // a reload may have happened while the handshake completed
            match store.current() {
                Some(server) => run_ws_session(socket, server, peer, settings, token).await,
                None => debug!(%remote, "no server generation after upgrade, dropping socket"),
            }
        })
}
