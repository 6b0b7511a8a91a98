//! Per-connection handler instances.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_core::ConnectionId;
use tracing::debug;

use super::context::HandlerContext;
use super::method::Handler;
use super::tree::HandlerTree;
use crate::connection::Connection;

/// Resolves `(connection, path)` to a lazily constructed handler instance.
///
/// Instances are cached per connection and path, so every request a
/// connection sends to one path reaches the same instance. [`dispose`]
/// forgets a connection's instances.
///
/// [`dispose`]: HandlerRegistry::dispose
pub struct HandlerRegistry {
    tree: HandlerTree,
    instances: Mutex<HashMap<ConnectionId, HashMap<String, Arc<dyn Handler>>>>,
}

impl HandlerRegistry {
    /// Registry over `tree` with no instances yet.
    pub fn new(tree: HandlerTree) -> Self {
        Self {
            tree,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// The mounted tree.
    pub fn tree(&self) -> &HandlerTree {
        &self.tree
    }

    /// Instance for `path` on `conn`, constructing it on first use.
    ///
    /// Returns `None` if nothing is mounted at `path`.
    pub fn resolve(&self, conn: &Arc<Connection>, path: &str) -> Option<Arc<dyn Handler>> {
        if let Some(handler) = self
            .instances
            .lock()
            .get(conn.id())
            .and_then(|by_path| by_path.get(path))
        {
            return Some(Arc::clone(handler));
        }

        let constructor = self.tree.lookup(path)?;
        let handler = constructor(HandlerContext::new(conn, path));

        let mut instances = self.instances.lock();
        let by_path = instances.entry(conn.id().clone()).or_default();
        let handler = by_path.entry(path.to_owned()).or_insert(handler);
        debug!(conn_id = %conn.id(), path, "handler instance constructed");
        Some(Arc::clone(handler))
    }

    /// Drop every instance constructed for `conn_id`. Returns how many.
    pub fn dispose(&self, conn_id: &ConnectionId) -> usize {
        let removed = self.instances.lock().remove(conn_id);
        let count = removed.map_or(0, |by_path| by_path.len());
        if count > 0 {
            debug!(conn_id = %conn_id, count, "handler instances disposed");
        }
        count
    }

    /// Number of live instances for `conn_id`.
    pub fn instance_count(&self, conn_id: &ConnectionId) -> usize {
        self.instances.lock().get(conn_id).map_or(0, HashMap::len)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("paths", &self.tree.paths())
            .finish_non_exhaustive()
    }
}
