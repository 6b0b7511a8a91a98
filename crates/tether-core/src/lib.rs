//! # tether-core
//!
//! Foundation types shared by every Tether crate:
//!
//! - **Envelope**: the JSON wire record exchanged over a socket (`path`, `id`,
//!   `method`, `args`, `return`, `error`) and its validity rules
//! - **Delivery queue**: single-flight, retry-until-done ordered processor used
//!   for outbound sends, pending-call expiry and inbound dispatch
//! - **Branded IDs**: `ConnectionId` newtype (UUID v7)
//! - **Errors**: `CallError` outcomes of an issued call
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod delivery;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;

pub use delivery::DeliveryQueue;
pub use envelope::{CallId, Envelope, EnvelopeError};
pub use errors::CallError;
pub use ids::ConnectionId;
