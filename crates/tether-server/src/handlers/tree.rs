//! Dot-path segment tree of mountable handler types.

use std::sync::Arc;

use super::RegistryError;
use super::context::HandlerContext;
use super::method::{Bound, Handler, Service};

/// Builds a handler instance bound to one connection.
pub type Constructor = Arc<dyn Fn(HandlerContext) -> Arc<dyn Handler> + Send + Sync>;

/// One node of the tree. A node may have a handler, children, or both.
pub struct Segment {
    name: String,
    constructor: Option<Constructor>,
    children: Vec<Segment>,
}

impl Segment {
    /// A node with no handler.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            children: Vec::new(),
        }
    }

    /// A node serving `S`. The method table is validated here.
    pub fn service<S: Service>(name: impl Into<String>) -> Result<Self, RegistryError> {
        Self::new(name).with_service::<S>()
    }

    /// Attach `S` as this node's handler.
    pub fn with_service<S: Service>(mut self) -> Result<Self, RegistryError> {
        let table = Arc::new(S::methods().build()?);
        self.constructor = Some(Arc::new(move |ctx| {
            Arc::new(Bound {
                service: Arc::new(S::construct(ctx)),
                table: Arc::clone(&table),
            }) as Arc<dyn Handler>
        }));
        Ok(self)
    }

    /// Attach a custom constructor as this node's handler.
    #[must_use]
    pub fn with_constructor(mut self, constructor: Constructor) -> Self {
        self.constructor = Some(constructor);
        self
    }

    /// Add a child node.
    #[must_use]
    pub fn child(mut self, child: Segment) -> Self {
        self.children.push(child);
        self
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("mounted", &self.constructor.is_some())
            .field("children", &self.children)
            .finish()
    }
}

/// Validated tree mapping dot-paths such as `admin.users` to handler types.
#[derive(Debug)]
pub struct HandlerTree {
    roots: Vec<Segment>,
}

impl HandlerTree {
    /// Validate segment names and build the tree.
    ///
    /// Names must be non-empty, free of `.` and whitespace, and unique among
    /// siblings.
    pub fn new(roots: Vec<Segment>) -> Result<Self, RegistryError> {
        validate(&roots)?;
        Ok(Self { roots })
    }

    /// A tree with no handlers.
    pub fn empty() -> Self {
        Self { roots: Vec::new() }
    }

    /// Constructor mounted at `path`, if any.
    pub fn lookup(&self, path: &str) -> Option<&Constructor> {
        let mut level = &self.roots;
        let mut node = None;
        for part in path.split('.') {
            let found = level.iter().find(|s| s.name == part)?;
            level = &found.children;
            node = Some(found);
        }
        node.and_then(|n| n.constructor.as_ref())
    }

    /// Every path with a mounted handler (sorted).
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect(&self.roots, "", &mut out);
        out.sort();
        out
    }
}

fn validate(level: &[Segment]) -> Result<(), RegistryError> {
    for (i, segment) in level.iter().enumerate() {
        let name = &segment.name;
        if name.is_empty() || name.contains('.') || name.contains(char::is_whitespace) {
            return Err(RegistryError::InvalidSegment(name.clone()));
        }
        if level[..i].iter().any(|s| s.name == *name) {
            return Err(RegistryError::DuplicateSegment(name.clone()));
        }
        validate(&segment.children)?;
    }
    Ok(())
}

fn collect(level: &[Segment], prefix: &str, out: &mut Vec<String>) {
    for segment in level {
        let path = if prefix.is_empty() {
            segment.name.clone()
        } else {
            format!("{prefix}.{}", segment.name)
        };
        if segment.constructor.is_some() {
            out.push(path.clone());
        }
        collect(&segment.children, &path, out);
    }
}
