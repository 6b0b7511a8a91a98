//! Pending call table: correlates responses to issued calls and expires
//! calls whose response never arrives.
//!
//! Every issued call gets a record keyed by its id and a slot in an expiry
//! [`DeliveryQueue`]. The expiry check keeps its head in place until the
//! record is settled or its timeout has elapsed since the frame was actually
//! written, so a call is never timed out before it was sent.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::{CallError, CallId, DeliveryQueue};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::RPC_CALLS_TIMED_OUT_TOTAL;

type Outcome = Result<Value, CallError>;

struct PendingCall {
    path: String,
    method: String,
    sent_at: Option<Instant>,
    reply: oneshot::Sender<Outcome>,
}

impl PendingCall {
    fn settle(self, id: CallId, outcome: Outcome) {
        if self.reply.send(outcome).is_err() {
            debug!(id, path = %self.path, method = %self.method, "reply future dropped before settlement");
        }
    }
}

struct Table {
    calls: Mutex<HashMap<CallId, PendingCall>>,
    timeout: Duration,
}

impl Table {
    /// Expiry check for the queue head. `true` advances the queue.
    fn expire(&self, id: CallId) -> bool {
        let call = {
            let mut calls = self.calls.lock();
            let Some(call) = calls.get(&id) else {
                return true;
            };
            let Some(sent_at) = call.sent_at else {
                return false;
            };
            if sent_at.elapsed() < self.timeout {
                return false;
            }
            calls.remove(&id)
        };
        if let Some(call) = call {
            warn!(id, path = %call.path, method = %call.method, "call timed out");
            counter!(RPC_CALLS_TIMED_OUT_TOTAL).increment(1);
            call.settle(id, Err(CallError::Timeout));
        }
        true
    }

    fn drain(&self) -> Vec<(CallId, PendingCall)> {
        self.calls.lock().drain().collect()
    }
}

/// Calls issued on one connection that have not settled yet.
pub(crate) struct PendingCalls {
    table: Arc<Table>,
    expiry: DeliveryQueue<CallId>,
}

impl PendingCalls {
    pub(crate) fn new(timeout: Duration, poll_interval: Duration) -> Self {
        let table = Arc::new(Table {
            calls: Mutex::new(HashMap::new()),
            timeout,
        });
        let check = Arc::clone(&table);
        let expiry = DeliveryQueue::new("expiry", poll_interval, move |id: &CallId| check.expire(*id));
        Self { table, expiry }
    }

    /// Record a new call and start watching it for expiry.
    pub(crate) fn track(&self, id: CallId, path: &str, method: &str) -> ReplyFuture {
        let (tx, rx) = oneshot::channel();
        let _ = self.table.calls.lock().insert(
            id,
            PendingCall {
                path: path.to_owned(),
                method: method.to_owned(),
                sent_at: None,
                reply: tx,
            },
        );
        if self.expiry.push(id).is_err() {
            let _ = self.settle(id, Err(CallError::Closed));
        }
        ReplyFuture::waiting(id, rx)
    }

    /// Start the timeout clock of a call whose frame was just written.
    pub(crate) fn mark_sent(&self, id: CallId) {
        if let Some(call) = self.table.calls.lock().get_mut(&id) {
            call.sent_at = Some(Instant::now());
        }
    }

    /// Settle a call. Returns `false` if no such call is pending.
    pub(crate) fn settle(&self, id: CallId, outcome: Outcome) -> bool {
        let call = self.table.calls.lock().remove(&id);
        match call {
            Some(call) => {
                call.settle(id, outcome);
                true
            }
            None => false,
        }
    }

    /// Reject every pending call with `error`, keeping the table usable.
    pub(crate) fn reject_all(&self, error: &CallError) -> usize {
        let drained = self.table.drain();
        let count = drained.len();
        for (id, call) in drained {
            call.settle(id, Err(error.clone()));
        }
        count
    }

    /// Stop expiry processing and reject every pending call with `error`.
    pub(crate) fn close(&self, error: &CallError) -> usize {
        let _ = self.expiry.close();
        self.reject_all(error)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.calls.lock().len()
    }
}

enum ReplyState {
    Waiting(oneshot::Receiver<Outcome>),
    Ready(Option<Outcome>),
}

/// Resolves with the outcome of an issued call.
///
/// Settles exactly once: with the peer's `return` value, with
/// [`CallError::Remote`] carrying the peer's `error` value, or with a local
/// failure ([`CallError::Timeout`], [`CallError::Closed`],
/// [`CallError::Abandoned`]).
pub struct ReplyFuture {
    id: Option<CallId>,
    state: ReplyState,
}

impl ReplyFuture {
    fn waiting(id: CallId, rx: oneshot::Receiver<Outcome>) -> Self {
        Self {
            id: Some(id),
            state: ReplyState::Waiting(rx),
        }
    }

    /// A future that is already settled with `error`.
    pub(crate) fn failed(error: CallError) -> Self {
        Self {
            id: None,
            state: ReplyState::Ready(Some(Err(error))),
        }
    }

    /// The call id, if the call was actually issued.
    pub fn id(&self) -> Option<CallId> {
        self.id
    }
}

impl Future for ReplyFuture {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            ReplyState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(CallError::Closed))),
            ReplyState::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(CallError::Closed)))
            }
        }
    }
}

impl std::fmt::Debug for ReplyFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyFuture").field("id", &self.id).finish_non_exhaustive()
    }
}
