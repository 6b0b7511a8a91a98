//! Demo services mounted by the host binary.

use std::sync::Arc;

use serde_json::{Value, json};
use tether_server::handlers::{HandlerContext, MethodTable, MethodTableBuilder, arg};
use tether_server::{HandlerTree, Segment, Service};

/// Stateless arithmetic.
pub struct MathService;

impl Service for MathService {
    fn construct(_ctx: HandlerContext) -> Self {
        Self
    }

    fn methods() -> MethodTableBuilder<Self> {
        MethodTable::builder()
            .sync_method("add", |_, args| {
                let (a, b): (f64, f64) = (arg(&args, 0)?, arg(&args, 1)?);
                Ok(json!(a + b))
            })
            .sync_method("mul", |_, args| {
                let (a, b): (f64, f64) = (arg(&args, 0)?, arg(&args, 1)?);
                Ok(json!(a * b))
            })
            .sync_method("div", |_, args| {
                let (a, b): (f64, f64) = (arg(&args, 0)?, arg(&args, 1)?);
                if b == 0.0 {
                    return Err(json!({"code": "DIV_ZERO", "message": "division by zero"}));
                }
                Ok(json!(a / b))
            })
    }
}

/// Per-connection session introspection and peer callbacks.
pub struct SessionService {
    ctx: HandlerContext,
}

impl Service for SessionService {
    fn construct(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    fn methods() -> MethodTableBuilder<Self> {
        MethodTable::builder()
            .sync_method("info", |s: &SessionService, _| {
                let session = s.ctx.session();
                Ok(json!({
                    "connection_id": session.connection_id.as_str(),
                    "remote_addr": session.remote_addr.map(|a| a.to_string()),
                    "fields": session.fields,
                }))
            })
            // asks the caller's own `session.echo` handler to answer
            .method("echo_back", |s: Arc<SessionService>, args| async move {
                s.ctx.call_peer("echo", args).await.map_err(|e| json!(e.to_string()))
            })
            .method("announce", |s: Arc<SessionService>, args| async move {
                let replies = s.ctx.call_all("session", "notice", args);
                let delivered = futures::future::join_all(replies.into_iter().map(|(_, reply)| reply))
                    .await
                    .into_iter()
                    .filter(Result::is_ok)
                    .count();
                Ok::<_, Value>(json!({"delivered": delivered}))
            })
    }
}

/// The tree every server generation mounts.
pub fn handler_tree() -> anyhow::Result<HandlerTree> {
    Ok(HandlerTree::new(vec![
        Segment::service::<MathService>("math")?,
        Segment::service::<SessionService>("session")?,
    ])?)
}
