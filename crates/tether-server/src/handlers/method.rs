//! Explicit method tables and the service trait.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::RegistryError;
use super::context::HandlerContext;

/// Result of a remotely callable method: `Ok` becomes the response's
/// `return`, `Err` its `error`.
pub type MethodResult = Result<Value, Value>;

/// Boxed future produced by invoking a method.
pub type MethodFuture = BoxFuture<'static, MethodResult>;

type MethodFn<S> = Arc<dyn Fn(Arc<S>, Vec<Value>) -> MethodFuture + Send + Sync>;

/// Names and implementations of the methods a service exposes remotely.
///
/// Only methods registered here are callable; everything else on the
/// service type stays private to the process.
pub struct MethodTable<S> {
    methods: BTreeMap<&'static str, MethodFn<S>>,
}

impl<S: Send + Sync + 'static> MethodTable<S> {
    /// Start an empty table.
    pub fn builder() -> MethodTableBuilder<S> {
        MethodTableBuilder {
            methods: Vec::new(),
        }
    }

    /// Whether `name` is callable.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Callable method names (sorted).
    pub fn names(&self) -> Vec<&'static str> {
        self.methods.keys().copied().collect()
    }

    /// Invoke `name` on `service`, or `None` if the method is not in the table.
    pub fn invoke(&self, service: &Arc<S>, name: &str, args: Vec<Value>) -> Option<MethodFuture> {
        self.methods
            .get(name)
            .map(|method| method(Arc::clone(service), args))
    }
}

impl<S> std::fmt::Debug for MethodTable<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.methods.keys()).finish()
    }
}

/// Accumulates methods; validated by [`build`](Self::build).
pub struct MethodTableBuilder<S> {
    methods: Vec<(&'static str, MethodFn<S>)>,
}

impl<S: Send + Sync + 'static> MethodTableBuilder<S> {
    /// Register an async method.
    #[must_use]
    pub fn method<F, Fut>(mut self, name: &'static str, method: F) -> Self
    where
        F: Fn(Arc<S>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let method: MethodFn<S> = Arc::new(move |service, args| Box::pin(method(service, args)));
        self.methods.push((name, method));
        self
    }

    /// Register a method whose body is synchronous. It still runs on the
    /// request's task, not at dispatch time.
    #[must_use]
    pub fn sync_method<F>(mut self, name: &'static str, method: F) -> Self
    where
        F: Fn(&S, Vec<Value>) -> MethodResult + Send + Sync + 'static,
    {
        let method = Arc::new(method);
        let method: MethodFn<S> = Arc::new(move |service, args| {
            let method = Arc::clone(&method);
            Box::pin(async move { (*method)(service.as_ref(), args) })
        });
        self.methods.push((name, method));
        self
    }

    /// Validate names and produce the table.
    pub fn build(self) -> Result<MethodTable<S>, RegistryError> {
        let mut methods = BTreeMap::new();
        for (name, method) in self.methods {
            if name.is_empty() || name.contains('.') || name.contains(char::is_whitespace) {
                return Err(RegistryError::InvalidMethodName(name.to_owned()));
            }
            if methods.insert(name, method).is_some() {
                return Err(RegistryError::DuplicateMethod(name.to_owned()));
            }
        }
        Ok(MethodTable { methods })
    }
}

/// A handler type mounted on the segment tree.
///
/// One instance is constructed per (connection, path) on first use and kept
/// until the connection is torn down.
pub trait Service: Send + Sync + Sized + 'static {
    /// Build a fresh instance bound to one connection.
    fn construct(ctx: HandlerContext) -> Self;

    /// The remotely callable methods of this type.
    fn methods() -> MethodTableBuilder<Self>;
}

/// A constructed, connection-bound handler instance.
pub trait Handler: Send + Sync {
    /// Callable method names.
    fn method_names(&self) -> Vec<&'static str>;

    /// Start `method`, or `None` if the handler does not expose it.
    fn invoke(&self, method: &str, args: Vec<Value>) -> Option<MethodFuture>;
}

/// A [`Service`] instance paired with its shared method table.
pub(crate) struct Bound<S> {
    pub(crate) service: Arc<S>,
    pub(crate) table: Arc<MethodTable<S>>,
}

impl<S: Send + Sync + 'static> Handler for Bound<S> {
    fn method_names(&self) -> Vec<&'static str> {
        self.table.names()
    }

    fn invoke(&self, method: &str, args: Vec<Value>) -> Option<MethodFuture> {
        self.table.invoke(&self.service, method, args)
    }
}

/// Decode positional argument `index`.
///
/// The error is a ready-to-send `error` value naming the argument.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, Value> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| json!(format!("Invalid argument {index}: {e}")))
}
