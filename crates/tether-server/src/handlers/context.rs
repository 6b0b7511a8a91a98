//! Capabilities handed to every handler instance.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tether_core::{CallError, ConnectionId};

use crate::connection::{Connection, ReplyFuture, SessionInfo};

/// A handler's view of the connection it serves.
///
/// Holds the connection weakly; once the connection is gone every call
/// resolves with [`CallError::Closed`].
#[derive(Clone)]
pub struct HandlerContext {
    connection: Weak<Connection>,
    path: String,
    session: SessionInfo,
}

impl HandlerContext {
    pub(crate) fn new(conn: &Arc<Connection>, path: &str) -> Self {
        Self {
            connection: Arc::downgrade(conn),
            path: path.to_owned(),
            session: conn.session().clone(),
        }
    }

    /// Path this handler is mounted at.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Session data of the connection.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Identifier of the connection.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.session.connection_id
    }

    /// Call `path.method(args)` on this connection's peer.
    pub fn call_one(&self, path: &str, method: &str, args: Vec<Value>) -> ReplyFuture {
        match self.connection.upgrade() {
            Some(conn) => conn.call(path, method, args),
            None => ReplyFuture::failed(CallError::Closed),
        }
    }

    /// Call `method(args)` on the peer's handler at this handler's own path.
    pub fn call_peer(&self, method: &str, args: Vec<Value>) -> ReplyFuture {
        self.call_one(&self.path, method, args)
    }

    /// Call `path.method(args)` on every connection of the owning server.
    pub fn call_all(&self, path: &str, method: &str, args: Vec<Value>) -> Vec<(ConnectionId, ReplyFuture)> {
        self.connection
            .upgrade()
            .map(|conn| conn.broadcast(path, method, args))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("path", &self.path)
            .field("connection_id", &self.session.connection_id)
            .finish()
    }
}
