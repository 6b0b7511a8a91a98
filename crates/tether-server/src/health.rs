//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

use crate::server::Server;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while a server generation is serving, `"starting"` otherwise.
    pub status: String,
    /// Seconds since the process started listening.
    pub uptime_secs: u64,
    /// Live connections of the current generation.
    pub connections: usize,
    /// Current server generation; `0` before the first one is published.
    pub generation: u64,
}

/// Build a health response for the current generation, if any.
pub fn health_check(start_time: Instant, server: Option<&Server>) -> HealthResponse {
    HealthResponse {
        status: if server.is_some() { "ok" } else { "starting" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: server.map_or(0, Server::connection_count),
        generation: server.map_or(0, Server::generation),
    }
}
