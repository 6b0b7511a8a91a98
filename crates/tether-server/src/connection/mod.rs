//! Per-peer RPC endpoint.
//!
//! A [`Connection`] owns everything needed to talk to one peer over one
//! socket: a monotonic call-id counter, an ordered outbound queue that waits
//! out back-pressure, the pending call table, and an inbound queue that
//! dispatches frames in arrival order. Requests resolve against the
//! connection's [`Binding`], which a server reload may swap without touching
//! the socket.

mod pending;
mod socket;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tether_core::{CallError, CallId, ConnectionId, DeliveryQueue, Envelope};
use tracing::{debug, error, info, trace, warn};

pub use pending::ReplyFuture;
pub use socket::{MemorySocket, SendError, Socket};

use pending::PendingCalls;

use crate::config::RpcConfig;
use crate::handlers::HandlerRegistry;
use crate::metrics::{RPC_CALLS_ISSUED_TOTAL, RPC_FRAMES_DROPPED_TOTAL, RPC_INBOUND_REQUESTS_TOTAL};
use crate::server::Server;

/// What the transport knows about the remote peer at accept time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Remote socket address, if known.
    pub remote_addr: Option<SocketAddr>,
    /// Request metadata: query parameters, selected headers.
    pub fields: BTreeMap<String, String>,
}

impl PeerInfo {
    /// Peer info with a remote address and no fields.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            remote_addr: Some(addr),
            fields: BTreeMap::new(),
        }
    }

    /// Add a metadata field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.fields.insert(key.into(), value.into());
        self
    }
}

/// Session data handlers can read about their connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    /// Connection identifier.
    pub connection_id: ConnectionId,
    /// Remote socket address, if known.
    pub remote_addr: Option<SocketAddr>,
    /// Request metadata captured at accept time.
    pub fields: BTreeMap<String, String>,
}

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting and issuing calls.
    Open,
    /// Teardown in progress.
    Closing,
    /// Torn down; every operation is a no-op.
    Closed,
}

/// Handler set and owning server a connection currently dispatches to.
#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) server: Weak<Server>,
}

impl Binding {
    /// A binding with no owning server, used on the client side.
    pub(crate) fn detached(handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            handlers,
            server: Weak::new(),
        }
    }
}

struct Outbound {
    frame: String,
    request: Option<CallId>,
}

/// One peer's end of the RPC channel.
pub struct Connection {
    id: ConnectionId,
    session: SessionInfo,
    socket: RwLock<Option<Arc<dyn Socket>>>,
    next_id: AtomicU64,
    state: Mutex<ConnectionState>,
    binding: RwLock<Option<Binding>>,
    pending: PendingCalls,
    outbound: DeliveryQueue<Outbound>,
    inbound: DeliveryQueue<String>,
}

impl Connection {
    /// Open a connection over `socket`, dispatching requests to `binding`.
    pub(crate) fn open(
        id: ConnectionId,
        socket: Arc<dyn Socket>,
        peer: PeerInfo,
        binding: Binding,
        config: &RpcConfig,
    ) -> Arc<Self> {
        let poll = config.poll_interval();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let writer = weak.clone();
            let outbound = DeliveryQueue::new("outbound", poll, move |item: &Outbound| {
                writer.upgrade().is_none_or(|conn| conn.transmit(item))
            });
            let reader = weak.clone();
            let inbound = DeliveryQueue::new("inbound", poll, move |frame: &String| {
                if let Some(conn) = reader.upgrade() {
                    conn.dispatch(frame);
                }
                true
            });
            Self {
                session: SessionInfo {
                    connection_id: id.clone(),
                    remote_addr: peer.remote_addr,
                    fields: peer.fields,
                },
                id,
                socket: RwLock::new(Some(socket)),
                next_id: AtomicU64::new(1),
                state: Mutex::new(ConnectionState::Open),
                binding: RwLock::new(Some(binding)),
                pending: PendingCalls::new(config.call_timeout(), poll),
                outbound,
                inbound,
            }
        })
    }

    /// Open a client-side connection that dispatches to `handlers` and has
    /// no owning server.
    pub fn open_detached(
        socket: Arc<dyn Socket>,
        peer: PeerInfo,
        handlers: Arc<HandlerRegistry>,
        config: &RpcConfig,
    ) -> Arc<Self> {
        Self::open(
            ConnectionId::new(),
            socket,
            peer,
            Binding::detached(handlers),
            config,
        )
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Session data captured at accept time.
    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the connection still accepts and issues calls.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Number of issued calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Number of frames waiting to be written, including a blocked head.
    pub fn queued_frames(&self) -> usize {
        self.outbound.len()
    }

    /// Issue a call to the peer.
    ///
    /// The request frame is queued behind everything issued earlier and is
    /// written as soon as the socket accepts it. The returned future settles
    /// with the peer's response, or with [`CallError::Timeout`] once the call
    /// has been on the wire for the configured timeout.
    pub fn call(&self, path: &str, method: &str, args: Vec<Value>) -> ReplyFuture {
        if !self.is_open() {
            return ReplyFuture::failed(CallError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = match Envelope::request(path, id, method, args).to_text() {
            Ok(frame) => frame,
            Err(e) => return ReplyFuture::failed(CallError::Encode(e.to_string())),
        };
        let reply = self.pending.track(id, path, method);
        if self
            .outbound
            .push(Outbound {
                frame,
                request: Some(id),
            })
            .is_err()
        {
            let _ = self.pending.settle(id, Err(CallError::Closed));
        }
        trace!(conn_id = %self.id, id, path, method, "call issued");
        counter!(RPC_CALLS_ISSUED_TOTAL).increment(1);
        reply
    }

    /// Issue `path.method(args)` on every connection of the owning server.
    ///
    /// A connection without an owning server treats itself as the only
    /// connection it knows.
    pub fn broadcast(&self, path: &str, method: &str, args: Vec<Value>) -> Vec<(ConnectionId, ReplyFuture)> {
        match self.server() {
            Some(server) => server.broadcast_call(path, method, args),
            None => vec![(self.id.clone(), self.call(path, method, args))],
        }
    }

    /// Feed one raw inbound frame from the transport.
    ///
    /// Frames are processed in arrival order. Frames arriving after teardown
    /// are dropped.
    pub fn receive(&self, frame: String) {
        if self.inbound.push(frame).is_err() {
            debug!(conn_id = %self.id, "frame received after teardown, dropping");
        }
    }

    /// Tell the outbound queue the socket may accept frames again.
    pub fn notify_writable(&self) {
        self.outbound.nudge();
    }

    /// Tear the connection down. Idempotent.
    ///
    /// Pending calls are rejected with [`CallError::Closed`], queued frames
    /// are discarded, handler instances are disposed, the owning server
    /// forgets the connection, and the socket is closed.
    pub fn teardown(&self) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Open {
                return;
            }
            *state = ConnectionState::Closing;
        }

        let _ = self.inbound.close();
        let discarded = self.outbound.close().len();
        let rejected = self.pending.close(&CallError::Closed);

        let binding = self.binding.write().take();
        if let Some(binding) = binding {
            let _ = binding.handlers.dispose(&self.id);
            if let Some(server) = binding.server.upgrade() {
                let _ = server.disconnection(&self.id);
            }
        }
        let socket = self.socket.write().take();
        if let Some(socket) = socket {
            socket.close();
        }

        *self.state.lock() = ConnectionState::Closed;
        info!(conn_id = %self.id, rejected, discarded, "connection torn down");
    }

    /// Move the connection to a new binding, abandoning calls issued under
    /// the old one. Returns `false` if the connection is no longer open.
    ///
    /// Holds the state lock across the swap so a concurrent teardown either
    /// sees the new binding or makes this return `false`.
    pub(crate) fn rebind(&self, binding: Binding) -> bool {
        let state = self.state.lock();
        if *state != ConnectionState::Open {
            return false;
        }
        let abandoned = self.pending.reject_all(&CallError::Abandoned);
        *self.binding.write() = Some(binding);
        drop(state);
        debug!(conn_id = %self.id, abandoned, "connection rebound");
        true
    }

    fn binding(&self) -> Option<Binding> {
        self.binding.read().clone()
    }

    fn server(&self) -> Option<Arc<Server>> {
        self.binding.read().as_ref().and_then(|b| b.server.upgrade())
    }

    /// Outbound queue completion: `true` once the frame is on the socket.
    fn transmit(&self, item: &Outbound) -> bool {
        let Some(socket) = self.socket.read().clone() else {
            return false;
        };
        match socket.send(&item.frame) {
            Ok(()) => {
                if let Some(id) = item.request {
                    self.pending.mark_sent(id);
                }
                true
            }
            Err(SendError::NotWritable) => {
                trace!(conn_id = %self.id, "socket not writable, holding frame");
                false
            }
            Err(SendError::Closed) => {
                debug!(conn_id = %self.id, "socket closed, holding frame");
                false
            }
        }
    }

    fn dispatch(self: &Arc<Self>, frame: &str) {
        let envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn_id = %self.id, error = %e, "dropping malformed frame");
                counter!(RPC_FRAMES_DROPPED_TOTAL).increment(1);
                return;
            }
        };
        if envelope.is_request() {
            self.handle_request(envelope);
        } else {
            self.handle_response(&envelope);
        }
    }

    fn handle_response(&self, envelope: &Envelope) {
        let outcome = envelope.outcome().map_err(CallError::Remote);
        if !self.pending.settle(envelope.id, outcome) {
            debug!(conn_id = %self.id, id = envelope.id, path = %envelope.path, "response matches no pending call, ignoring");
        }
    }

    fn handle_request(self: &Arc<Self>, envelope: Envelope) {
        let Envelope {
            path,
            id,
            method,
            args,
            ..
        } = envelope;
        let method = method.unwrap_or_default();
        counter!(RPC_INBOUND_REQUESTS_TOTAL).increment(1);

        let Some(binding) = self.binding() else {
            self.respond(Envelope::failure(&path, id, json!("Connection is not bound")));
            return;
        };
        // construction and the synchronous part of a method run here, outside
        // the spawned task, so they need their own unwind boundary
        let started = catch_unwind(AssertUnwindSafe(|| {
            binding
                .handlers
                .resolve(self, &path)
                .map(|handler| handler.invoke(&method, args.unwrap_or_default()))
        }));
        let call = match started {
            Ok(Some(Some(call))) => call,
            Ok(Some(None)) => {
                warn!(conn_id = %self.id, id, path = %path, method = %method, "request for unknown method");
                self.respond(Envelope::failure(
                    &path,
                    id,
                    json!(format!("Invalid method: {path}.{method}")),
                ));
                return;
            }
            Ok(None) => {
                warn!(conn_id = %self.id, id, path = %path, method = %method, "request for unknown path");
                self.respond(Envelope::failure(&path, id, json!(format!("Invalid path: {path}"))));
                return;
            }
            Err(_) => {
                error!(conn_id = %self.id, id, path = %path, method = %method, "handler panicked before its call started");
                self.respond(Envelope::failure(&path, id, json!(format!("Handler panicked: {path}.{method}"))));
                return;
            }
        };

        let conn = Arc::clone(self);
        let _ = tokio::spawn(async move {
            let response = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(value)) => Envelope::success(&path, id, value),
                Ok(Err(error)) => {
                    debug!(conn_id = %conn.id, id, path = %path, method = %method, "handler returned an error");
                    Envelope::failure(&path, id, error)
                }
                Err(_) => {
                    error!(conn_id = %conn.id, id, path = %path, method = %method, "handler panicked");
                    Envelope::failure(&path, id, json!(format!("Handler panicked: {path}.{method}")))
                }
            };
            conn.respond(response);
        });
    }

    fn respond(&self, envelope: Envelope) {
        let frame = match envelope.to_text() {
            Ok(frame) => frame,
            Err(e) => {
                error!(conn_id = %self.id, id = envelope.id, error = %e, "failed to encode response");
                return;
            }
        };
        if self
            .outbound
            .push(Outbound {
                frame,
                request: None,
            })
            .is_err()
        {
            debug!(conn_id = %self.id, id = envelope.id, "connection closed, response discarded");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // queue tasks only hold weak references; stop them when no teardown ran
        let _ = self.inbound.close();
        let _ = self.outbound.close();
        let _ = self.pending.close(&CallError::Closed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
