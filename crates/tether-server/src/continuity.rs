//! Where the live server generation is published across reloads.
//!
//! A new [`Server`] reads the previous generation from the store, adopts its
//! live connections, and publishes itself. The acceptor routes every new
//! socket to whatever generation is current.

use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use crate::server::Server;

/// Holder of the current server generation.
pub trait ContinuityStore: Send + Sync {
    /// The generation currently serving, if any.
    fn current(&self) -> Option<Arc<Server>>;

    /// Make `server` the current generation.
    fn publish(&self, server: Arc<Server>);
}

/// In-process [`ContinuityStore`].
#[derive(Default)]
pub struct GenerationSlot {
    slot: RwLock<Option<Arc<Server>>>,
}

static PROCESS_SLOT: LazyLock<GenerationSlot> = LazyLock::new(GenerationSlot::new);

impl GenerationSlot {
    /// An empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide slot.
    pub fn process() -> &'static Self {
        &PROCESS_SLOT
    }

    /// Remove and return the current generation.
    pub fn clear(&self) -> Option<Arc<Server>> {
        self.slot.write().take()
    }
}

impl ContinuityStore for GenerationSlot {
    fn current(&self) -> Option<Arc<Server>> {
        self.slot.read().clone()
    }

    fn publish(&self, server: Arc<Server>) {
        *self.slot.write() = Some(server);
    }
}
