//! Transport seam between a [`Connection`](super::Connection) and the wire.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Why a frame could not be handed to the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The transport is temporarily unable to accept frames; retry later.
    #[error("socket not writable")]
    NotWritable,
    /// The transport is gone.
    #[error("socket closed")]
    Closed,
}

/// A bidirectional text transport.
///
/// Inbound frames are pushed by the transport's owner into
/// [`Connection::receive`](super::Connection::receive); the connection only
/// ever writes through this trait.
pub trait Socket: Send + Sync {
    /// Hand one text frame to the transport.
    fn send(&self, frame: &str) -> Result<(), SendError>;

    /// Whether a `send` right now would be accepted.
    fn is_writable(&self) -> bool;

    /// Close the transport. Idempotent.
    fn close(&self);
}

/// In-memory socket that records every accepted frame.
///
/// Writability can be toggled to simulate back-pressure.
#[derive(Default)]
pub struct MemorySocket {
    frames: Mutex<Vec<String>>,
    blocked: AtomicBool,
    closed: AtomicBool,
}

impl MemorySocket {
    /// A writable, open socket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `send` fail with [`SendError::NotWritable`] while `blocked`.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Frames accepted so far, in send order.
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// Remove and return the accepted frames.
    pub fn take_frames(&self) -> Vec<String> {
        std::mem::take(&mut *self.frames.lock())
    }

    /// Whether [`Socket::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Socket for MemorySocket {
    fn send(&self, frame: &str) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        if self.blocked.load(Ordering::SeqCst) {
            return Err(SendError::NotWritable);
        }
        self.frames.lock().push(frame.to_owned());
        Ok(())
    }

    fn is_writable(&self) -> bool {
        !self.is_closed() && !self.blocked.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_frames_in_order() {
        let socket = MemorySocket::new();
        socket.send("a").unwrap();
        socket.send("b").unwrap();
        assert_eq!(socket.frames(), vec!["a", "b"]);
        assert_eq!(socket.take_frames().len(), 2);
        assert!(socket.frames().is_empty());
    }

    #[test]
    fn blocked_socket_is_not_writable() {
        let socket = MemorySocket::new();
        socket.set_blocked(true);
        assert!(!socket.is_writable());
        assert_eq!(socket.send("a"), Err(SendError::NotWritable));
        socket.set_blocked(false);
        assert!(socket.is_writable());
        assert!(socket.send("a").is_ok());
    }

    #[test]
    fn closed_socket_rejects_frames() {
        let socket = MemorySocket::new();
        socket.close();
        socket.close();
        assert!(socket.is_closed());
        assert!(!socket.is_writable());
        assert_eq!(socket.send("a"), Err(SendError::Closed));
    }
}
