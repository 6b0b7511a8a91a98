//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections accepted total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections of the current generation (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket session duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Upgrades refused because the connection limit was reached (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "ws_connections_rejected_total";
/// Calls issued to peers (counter).
pub const RPC_CALLS_ISSUED_TOTAL: &str = "rpc_calls_issued_total";
/// Issued calls that timed out (counter).
pub const RPC_CALLS_TIMED_OUT_TOTAL: &str = "rpc_calls_timed_out_total";
/// Requests received from peers (counter).
pub const RPC_INBOUND_REQUESTS_TOTAL: &str = "rpc_inbound_requests_total";
/// Inbound frames dropped as malformed (counter).
pub const RPC_FRAMES_DROPPED_TOTAL: &str = "rpc_frames_dropped_total";
/// Server generations started by reloads (counter).
pub const SERVER_RELOADS_TOTAL: &str = "server_reloads_total";
