//! Handler registry: mount service types on a dot-path tree and resolve
//! requests to per-connection instances.
//!
//! ```text
//! math          -> MathService
//! admin.users   -> UsersService
//! ```
//!
//! A request for `admin.users` on connection `c` reaches the instance
//! constructed for `(c, "admin.users")`, created on first use with a
//! [`HandlerContext`] that lets it call back into its own peer or into every
//! connection of the server.

mod context;
mod method;
mod registry;
mod tree;

pub use context::HandlerContext;
pub use method::{Handler, MethodFuture, MethodResult, MethodTable, MethodTableBuilder, Service, arg};
pub use registry::HandlerRegistry;
pub use tree::{Constructor, HandlerTree, Segment};

/// Invalid handler tree or method table.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Method names must be non-empty and free of `.` and whitespace.
    #[error("invalid method name '{0}'")]
    InvalidMethodName(String),
    /// A method table lists the same name twice.
    #[error("duplicate method '{0}'")]
    DuplicateMethod(String),
    /// Segment names must be non-empty and free of `.` and whitespace.
    #[error("invalid segment name '{0}'")]
    InvalidSegment(String),
    /// Two sibling segments share a name.
    #[error("duplicate segment '{0}'")]
    DuplicateSegment(String),
}
