//! WebSocket transport: the server-side session loop, the channel-backed
//! socket both sides write through, and the dialing client.

pub mod client;
pub mod link;
pub mod session;

pub use client::{ClientError, ClientSession, connect};
pub use link::WsLink;
pub use session::{SessionSettings, run_ws_session};
