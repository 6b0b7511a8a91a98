//! Channel-backed [`Socket`] feeding a WebSocket writer task.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Duration, Instant};

use crate::connection::{SendError, Socket};

/// Socket half handed to a [`Connection`](crate::Connection).
///
/// Frames go into a bounded channel drained by the session's writer task; a
/// full channel reports [`SendError::NotWritable`] so the connection holds the
/// frame and retries. Also tracks peer liveness for the heartbeat.
pub struct WsLink {
    tx: mpsc::Sender<String>,
    open: AtomicBool,
    saturated: AtomicBool,
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    refused_frames: AtomicU64,
}

impl WsLink {
    /// Create a link over the writer task's channel.
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx,
            open: AtomicBool::new(true),
            saturated: AtomicBool::new(false),
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(Instant::now()),
            refused_frames: AtomicU64::new(0),
        }
    }

    /// Clear and return whether a send was refused since the last call.
    ///
    /// The writer calls this after draining a frame to decide whether the
    /// connection should be told the socket is writable again.
    pub fn take_saturated(&self) -> bool {
        self.saturated.swap(false, Ordering::AcqRel)
    }

    /// Sends refused because the channel was full.
    pub fn refused_frames(&self) -> u64 {
        self.refused_frames.load(Ordering::Relaxed)
    }

    /// Mark the peer as alive (any inbound frame, pong included).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag for the heartbeat.
    ///
    /// Returns `true` if the peer was heard from since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the peer was last heard from.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

impl Socket for WsLink {
    fn send(&self, frame: &str) -> Result<(), SendError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }
        match self.tx.try_send(frame.to_owned()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.saturated.store(true, Ordering::Release);
                let _ = self.refused_frames.fetch_add(1, Ordering::Relaxed);
                Err(SendError::NotWritable)
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    fn is_writable(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.tx.capacity() > 0
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}
