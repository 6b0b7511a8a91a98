//! # tether-server
//!
//! Correlated bidirectional RPC over long-lived WebSocket sessions.
//!
//! - `Connection`: per-peer call-id counter, ordered outbound queue, pending
//!   call table with timeouts, inbound dispatch queue
//! - Handler registry: dot-path segment tree resolving to lazily constructed,
//!   per-connection service instances with explicit method tables
//! - `Server`: connection registry, broadcast calls, hot-reload continuity
//!   (a new generation adopts the previous generation's live sockets)
//! - Axum `/ws` acceptor, `/health`, `/metrics`, and a `tokio-tungstenite`
//!   client for the peer side
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod continuity;
pub mod gateway;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod server;
pub mod settings;
pub mod shutdown;
pub mod websocket;

#[cfg(test)]
mod test_helpers;

pub use config::{RpcConfig, ServerConfig};
pub use connection::{Connection, ConnectionState, PeerInfo, ReplyFuture, SessionInfo};
pub use continuity::{ContinuityStore, GenerationSlot};
pub use gateway::{Gateway, ServerError};
pub use handlers::{HandlerContext, HandlerTree, MethodTable, Segment, Service};
pub use server::Server;
pub use settings::{Settings, SettingsError, load_settings};
pub use shutdown::ShutdownCoordinator;
pub use websocket::{ClientError, ClientSession, connect};
