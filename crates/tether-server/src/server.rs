//! Server generation: connection registry, broadcast, and reload adoption.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde_json::Value;
use tether_core::ConnectionId;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RpcConfig;
use crate::connection::{Binding, Connection, PeerInfo, ReplyFuture, Socket};
use crate::continuity::ContinuityStore;
use crate::handlers::{HandlerRegistry, HandlerTree};
use crate::metrics::{SERVER_RELOADS_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL};

/// One generation of the RPC server.
///
/// Building a new generation over a [`ContinuityStore`] that already holds
/// one takes over the old generation's live connections: each is rebound
/// to the new handler set, its calls issued under the old generation are
/// abandoned, and its old handler instances are disposed. Sockets stay open.
/// A socket accepted by a generation that has already been taken over is
/// registered with its successor instead.
pub struct Server {
    generation: u64,
    config: RpcConfig,
    handlers: Arc<HandlerRegistry>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    successor: OnceLock<Weak<Server>>,
    started_at: Instant,
}

impl Server {
    /// Build a generation serving `tree`, adopt the previous generation's
    /// connections from `store`, and publish the new generation there.
    pub fn new(config: RpcConfig, tree: HandlerTree, store: &dyn ContinuityStore) -> Arc<Self> {
        let previous = store.current();
        let generation = previous.as_ref().map_or(1, |p| p.generation + 1);
        let server = Arc::new(Self {
            generation,
            config,
            handlers: Arc::new(HandlerRegistry::new(tree)),
            connections: RwLock::new(HashMap::new()),
            successor: OnceLock::new(),
            started_at: Instant::now(),
        });
        if let Some(previous) = previous {
            server.adopt(&previous);
        }
        store.publish(Arc::clone(&server));
        info!(generation, paths = ?server.handlers.tree().paths(), "server generation started");
        server
    }

    fn adopt(self: &Arc<Self>, previous: &Self) {
        let inherited: Vec<Arc<Connection>> = {
            let mut connections = previous.connections.write();
            // accepts racing this drain see the successor under the same lock
            let _ = previous.successor.set(Arc::downgrade(self));
            connections.drain().map(|(_, conn)| conn).collect()
        };
        counter!(SERVER_RELOADS_TOTAL).increment(1);
        let mut adopted = 0_usize;
        for conn in inherited {
            // registered before rebinding so a teardown right after the
            // rebind finds it here
            let _ = self.connections.write().insert(conn.id().clone(), Arc::clone(&conn));
            let rebound = conn.rebind(self.binding());
            let _ = previous.handlers.dispose(conn.id());
            if !rebound {
                let _ = self.disconnection(conn.id());
                debug!(conn_id = %conn.id(), "skipping closed connection during adoption");
                continue;
            }
            adopted += 1;
        }
        info!(
            generation = self.generation,
            previous = previous.generation,
            adopted,
            "adopted connections from previous generation"
        );
    }

    fn binding(self: &Arc<Self>) -> Binding {
        Binding {
            handlers: Arc::clone(&self.handlers),
            server: Arc::downgrade(self),
        }
    }

    /// Register a freshly opened socket as a new connection.
    ///
    /// On a generation that has been taken over, the socket goes to the
    /// newest live successor.
    pub fn accept(self: &Arc<Self>, socket: Arc<dyn Socket>, peer: PeerInfo) -> Arc<Connection> {
        let mut connections = self.connections.write();
        if let Some(successor) = self.successor() {
            drop(connections);
            debug!(generation = self.generation, successor = successor.generation, "forwarding accept to successor");
            return successor.accept(socket, peer);
        }
        let conn = Connection::open(ConnectionId::new(), socket, peer, self.binding(), &self.config);
        let _ = connections.insert(conn.id().clone(), Arc::clone(&conn));
        drop(connections);
        info!(conn_id = %conn.id(), remote = ?conn.session().remote_addr, generation = self.generation, "connection accepted");
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
        conn
    }

    /// Forget a connection. Called by the connection's own teardown.
    pub fn disconnection(&self, conn_id: &ConnectionId) -> bool {
        let removed = self.connections.write().remove(conn_id).is_some();
        if removed {
            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
            debug!(conn_id = %conn_id, generation = self.generation, "connection removed");
        }
        removed
    }

    /// Issue `path.method(args)` on every connection.
    ///
    /// Each reply settles independently; a silent peer only times out its own
    /// entry.
    pub fn broadcast_call(&self, path: &str, method: &str, args: Vec<Value>) -> Vec<(ConnectionId, ReplyFuture)> {
        let targets = self.connections();
        debug!(path, method, targets = targets.len(), "broadcast call");
        targets
            .into_iter()
            .map(|conn| (conn.id().clone(), conn.call(path, method, args.clone())))
            .collect()
    }

    /// Tear down every connection. Returns how many were open.
    pub fn teardown_all(&self) -> usize {
        let targets = self.connections();
        for conn in &targets {
            conn.teardown();
        }
        targets.len()
    }

    /// Connection by id.
    pub fn connection(&self, conn_id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(conn_id).cloned()
    }

    /// Snapshot of all connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// The generation that took this one over, if it is still alive.
    pub fn successor(&self) -> Option<Arc<Server>> {
        self.successor.get().and_then(Weak::upgrade)
    }

    /// Whether a newer generation has taken this one over.
    pub fn is_retired(&self) -> bool {
        self.successor.get().is_some()
    }

    /// Generation number, starting at 1 and incremented by each reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The handler registry of this generation.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Call timing applied to connections accepted by this generation.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Time since this generation started.
    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("generation", &self.generation)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, MemorySocket};
    use crate::continuity::GenerationSlot;
    use crate::handlers::Segment;
    use crate::test_helpers::{MathService, POLL, TIMEOUT, flush, reply, request, rpc_config, sent, tree};
    use futures::FutureExt;
    use serde_json::json;
    use tether_core::CallError;

    fn accept(server: &Arc<Server>) -> (Arc<Connection>, Arc<MemorySocket>) {
        let socket = Arc::new(MemorySocket::new());
        let conn = server.accept(Arc::clone(&socket) as Arc<dyn Socket>, PeerInfo::default());
        (conn, socket)
    }

    fn math_only() -> HandlerTree {
        HandlerTree::new(vec![Segment::service::<MathService>("math").unwrap()]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn accept_registers_and_teardown_unregisters() {
        let slot = GenerationSlot::new();
        let server = Server::new(rpc_config(), tree(), &slot);
        let (a, _) = accept(&server);
        let (b, _) = accept(&server);
        assert_ne!(a.id(), b.id());
        assert_eq!(server.connection_count(), 2);
        assert!(server.connection(a.id()).is_some());

        a.teardown();
        assert_eq!(server.connection_count(), 1);
        assert!(server.connection(a.id()).is_none());
        assert!(!server.disconnection(a.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_connection_serves_requests() {
        let slot = GenerationSlot::new();
        let server = Server::new(rpc_config(), tree(), &slot);
        let (conn, socket) = accept(&server);
        request(&conn, "math", 1, "add", json!([2, 3]));
        flush().await;
        assert_eq!(sent(&socket), vec![json!({"path": "math", "id": 1, "return": 5.0})]);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_settles_each_peer_independently() {
        let slot = GenerationSlot::new();
        let server = Server::new(rpc_config(), tree(), &slot);
        let peers: Vec<_> = (0..3).map(|_| accept(&server)).collect();

        let mut replies = server.broadcast_call("ui", "refresh", vec![json!("all")]);
        assert_eq!(replies.len(), 3);
        flush().await;

        for (_, socket) in &peers {
            let frames = sent(socket);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["method"], json!("refresh"));
            assert_eq!(frames[0]["args"], json!(["all"]));
        }

        let silent = peers[2].0.id().clone();
        reply(&peers[0].0, "ui", 1, json!("ok-0"));
        reply(&peers[1].0, "ui", 1, json!("ok-1"));
        flush().await;

        for (id, future) in &mut replies {
            let outcome = future.now_or_never();
            if *id == silent {
                assert!(outcome.is_none(), "silent peer must still be pending");
            } else {
                assert!(matches!(outcome, Some(Ok(v)) if v.as_str().unwrap().starts_with("ok-")));
            }
        }

        tokio::time::sleep(TIMEOUT + POLL * 2).await;
        let (_, silent_reply) = replies.into_iter().find(|(id, _)| *id == silent).unwrap();
        assert_eq!(silent_reply.await, Err(CallError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_with_no_connections_is_empty() {
        let slot = GenerationSlot::new();
        let server = Server::new(rpc_config(), tree(), &slot);
        assert!(server.broadcast_call("ui", "refresh", vec![]).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn handler_call_all_reaches_every_connection() {
        let slot = GenerationSlot::new();
        let server = Server::new(rpc_config(), tree(), &slot);
        let (caller, caller_socket) = accept(&server);
        let (_other, other_socket) = accept(&server);

        request(&caller, "tally", 9, "ask_all", json!([]));
        flush().await;

        let caller_frames = sent(&caller_socket);
        assert!(caller_frames.contains(&json!({"path": "tally", "id": 9, "return": 2})));
        assert!(caller_frames.iter().any(|f| f["method"] == json!("ping")));
        assert_eq!(sent(&other_socket)[0]["method"], json!("ping"));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_adopts_live_connections() {
        let slot = GenerationSlot::new();
        let first = Server::new(rpc_config(), tree(), &slot);
        let (conn, socket) = accept(&first);

        request(&conn, "tally", 1, "bump", json!([]));
        flush().await;
        let _ = sent(&socket);
        assert_eq!(first.handlers().instance_count(conn.id()), 1);
        let in_flight = first.broadcast_call("ui", "refresh", vec![]);
        flush().await;

        let second = Server::new(rpc_config(), math_only(), &slot);
        assert_eq!(second.generation(), 2);
        assert!(Arc::ptr_eq(&slot.current().unwrap(), &second));
        assert_eq!(first.connection_count(), 0);
        assert_eq!(second.connection_count(), 1);
        assert_eq!(first.handlers().instance_count(conn.id()), 0);
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(!socket.is_closed());

        for (_, reply) in in_flight {
            assert_eq!(reply.await, Err(CallError::Abandoned));
        }

        request(&conn, "tally", 2, "bump", json!([]));
        request(&conn, "math", 3, "add", json!([1, 2]));
        flush().await;
        let frames = sent(&socket);
        assert!(frames.contains(&json!({"path": "tally", "id": 2, "error": "Invalid path: tally"})));
        assert!(frames.contains(&json!({"path": "math", "id": 3, "return": 3.0})));

        conn.teardown();
        assert_eq!(second.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_after_reload_continue_the_id_sequence() {
        let slot = GenerationSlot::new();
        let first = Server::new(rpc_config(), tree(), &slot);
        let (conn, socket) = accept(&first);
        let _ = conn.call("ui", "a", vec![]);
        let _second = Server::new(rpc_config(), tree(), &slot);
        let mut reply_future = conn.call("ui", "b", vec![]);
        flush().await;

        let ids: Vec<_> = sent(&socket).iter().map(|f| f["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2)]);

        reply(&conn, "ui", 1, json!("stale"));
        flush().await;
        assert!((&mut reply_future).now_or_never().is_none());
        reply(&conn, "ui", 2, json!("fresh"));
        assert_eq!(reply_future.await, Ok(json!("fresh")));
    }

    #[tokio::test(start_paused = true)]
    async fn instances_after_reload_are_fresh() {
        let slot = GenerationSlot::new();
        let first = Server::new(rpc_config(), tree(), &slot);
        let (conn, socket) = accept(&first);
        request(&conn, "tally", 1, "bump", json!([]));
        request(&conn, "tally", 2, "bump", json!([]));
        flush().await;

        let _second = Server::new(rpc_config(), tree(), &slot);
        request(&conn, "tally", 3, "bump", json!([]));
        flush().await;

        let returns: Vec<_> = sent(&socket).into_iter().map(|f| f["return"].clone()).collect();
        assert_eq!(returns, vec![json!(1), json!(2), json!(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_on_retired_generation_lands_in_successor() {
        let slot = GenerationSlot::new();
        let first = Server::new(rpc_config(), tree(), &slot);
        let second = Server::new(rpc_config(), math_only(), &slot);
        assert!(first.is_retired());
        assert!(!second.is_retired());
        assert!(Arc::ptr_eq(&first.successor().unwrap(), &second));

        let (conn, socket) = accept(&first);
        assert_eq!(first.connection_count(), 0);
        assert_eq!(second.connection_count(), 1);
        assert!(second.connection(conn.id()).is_some());

        request(&conn, "tally", 1, "bump", json!([]));
        request(&conn, "math", 2, "add", json!([1, 2]));
        flush().await;
        let frames = sent(&socket);
        assert!(frames.contains(&json!({"path": "tally", "id": 1, "error": "Invalid path: tally"})));
        assert!(frames.contains(&json!({"path": "math", "id": 2, "return": 3.0})));

        conn.teardown();
        assert_eq!(second.connection_count(), 0);
    }

    #[test]
    fn accept_follows_successor_chain() {
        let slot = GenerationSlot::new();
        let first = Server::new(rpc_config(), tree(), &slot);
        let _second = Server::new(rpc_config(), tree(), &slot);
        let third = Server::new(rpc_config(), tree(), &slot);
        let (conn, _) = accept(&first);
        assert!(third.connection(conn.id()).is_some());
        assert_eq!(third.connection_count(), 1);
    }

    #[test]
    fn connection_closed_before_rebind_is_not_adopted() {
        let slot = GenerationSlot::new();
        let first = Server::new(rpc_config(), tree(), &slot);
        // closed while still listed, as when teardown lands after the drain
        let socket = Arc::new(MemorySocket::new());
        let conn = Connection::open(
            ConnectionId::new(),
            socket as Arc<dyn Socket>,
            PeerInfo::default(),
            Binding::detached(Arc::clone(first.handlers())),
            &rpc_config(),
        );
        let _ = first.connections.write().insert(conn.id().clone(), Arc::clone(&conn));
        conn.teardown();

        let second = Server::new(rpc_config(), tree(), &slot);
        assert_eq!(first.connection_count(), 0);
        assert_eq!(second.connection_count(), 0);
    }

    #[test]
    fn teardown_racing_adoption_leaves_no_stale_entry() {
        for _ in 0..200 {
            let slot = GenerationSlot::new();
            let first = Server::new(rpc_config(), tree(), &slot);
            let (conn, socket) = accept(&first);
            let barrier = std::sync::Barrier::new(2);
            let second = std::thread::scope(|scope| {
                let _ = scope.spawn(|| {
                    let _ = barrier.wait();
                    conn.teardown();
                });
                let _ = barrier.wait();
                Server::new(rpc_config(), tree(), &slot)
            });
            assert_eq!(conn.state(), ConnectionState::Closed);
            assert!(socket.is_closed());
            assert_eq!(first.connection_count(), 0);
            assert_eq!(second.connection_count(), 0);
        }
    }

    #[test]
    fn generations_increase_per_store() {
        let slot = GenerationSlot::new();
        let other = GenerationSlot::new();
        assert_eq!(Server::new(rpc_config(), tree(), &slot).generation(), 1);
        assert_eq!(Server::new(rpc_config(), tree(), &slot).generation(), 2);
        assert_eq!(Server::new(rpc_config(), tree(), &other).generation(), 1);
    }
}
