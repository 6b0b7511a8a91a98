//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing of calls issued on a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// How long an issued call may wait for its response after being sent.
    pub call_timeout_ms: u64,
    /// Retry interval of the delivery queues (send retries, expiry scans).
    pub poll_interval_ms: u64,
}

impl RpcConfig {
    /// Call timeout as a `Duration`.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Poll interval as a `Duration` (never zero).
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            poll_interval_ms: 1_000,
        }
    }
}

/// Configuration for the Tether server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server-initiated Ping frames, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Disconnect a client that has been silent this long, in seconds.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Frames buffered toward the socket writer before the socket reports
    /// itself unwritable.
    pub send_buffer: usize,
    /// Call timing.
    pub rpc: RpcConfig,
}

impl ServerConfig {
    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            send_buffer: 256,
            rpc: RpcConfig::default(),
        }
    }
}
