//! Shared fixtures for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use crate::config::RpcConfig;
use crate::connection::{Connection, MemorySocket, PeerInfo, Socket};
use crate::handlers::{
    HandlerContext, HandlerRegistry, HandlerTree, MethodTable, MethodTableBuilder, Segment, Service, arg,
};

pub(crate) const TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const POLL: Duration = Duration::from_millis(100);

pub(crate) fn rpc_config() -> RpcConfig {
    RpcConfig {
        call_timeout_ms: 5_000,
        poll_interval_ms: 100,
    }
}

/// Let every ready task run (queues, spawned handlers) under paused time.
pub(crate) async fn flush() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub(crate) struct MathService;

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
            .sync_method("div", |_, args| {
                let (a, b): (f64, f64) = (arg(&args, 0)?, arg(&args, 1)?);
                if b == 0.0 {
                    return Err(json!({"code": "DIV_ZERO", "message": "division by zero"}));
                }
                Ok(json!(a / b))
            })
            .method("slow", |_, args| async move {
                let ms: u64 = arg(&args, 0)?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, Value>(json!(ms))
            })
    }
}

/// Stateful service: exposes its instance identity through a counter.
pub(crate) struct TallyService {
    ctx: HandlerContext,
    count: AtomicU64,
}

impl Service for TallyService {
    fn construct(ctx: HandlerContext) -> Self {
        Self {
            ctx,
            count: AtomicU64::new(0),
        }
    }

    fn methods() -> MethodTableBuilder<Self> {
        MethodTable::builder()
            .sync_method("bump", |t: &TallyService, _| {
                Ok(json!(t.count.fetch_add(1, Ordering::SeqCst) + 1))
            })
            .sync_method("whoami", |t: &TallyService, _| {
                Ok(json!({"conn": t.ctx.connection_id().as_str(), "path": t.ctx.path()}))
            })
            .method("ask_peer", |t: Arc<TallyService>, args| async move {
                let method: String = arg(&args, 0)?;
                t.ctx
                    .call_peer(&method, args.into_iter().skip(1).collect())
                    .await
                    .map_err(|e| json!(e.to_string()))
            })
            .method("ask_all", |t: Arc<TallyService>, _| async move {
                let replies = t.ctx.call_all("peer", "ping", vec![]);
                Ok::<_, Value>(json!(replies.len()))
            })
    }
}

pub(crate) struct PanicService;

impl Service for PanicService {
    fn construct(_ctx: HandlerContext) -> Self {
        Self
    }

    fn methods() -> MethodTableBuilder<Self> {
        MethodTable::builder()
            .method("boom", |_, args: Vec<Value>| async move {
                match args.first() {
                    Some(v) => Ok::<_, Value>(v.clone()),
                    None => panic!("boom"),
                }
            })
            .sync_method("sync_boom", |_, _| panic!("sync boom"))
    }
}

pub(crate) fn tree() -> HandlerTree {
    HandlerTree::new(vec![
        Segment::service::<MathService>("math").unwrap(),
        Segment::service::<TallyService>("tally").unwrap(),
        Segment::service::<PanicService>("panic").unwrap(),
        Segment::new("admin").child(Segment::service::<TallyService>("users").unwrap()),
    ])
    .unwrap()
}

pub(crate) fn registry() -> Arc<HandlerRegistry> {
    Arc::new(HandlerRegistry::new(tree()))
}

/// A client-side connection over a memory socket.
pub(crate) fn detached(handlers: &Arc<HandlerRegistry>) -> (Arc<Connection>, Arc<MemorySocket>) {
    let socket = Arc::new(MemorySocket::new());
    let conn = Connection::open_detached(
        Arc::clone(&socket) as Arc<dyn Socket>,
        PeerInfo::default(),
        Arc::clone(handlers),
        &rpc_config(),
    );
    (conn, socket)
}

pub(crate) fn parse(frame: &str) -> Value {
    serde_json::from_str(frame).unwrap()
}

pub(crate) fn sent(socket: &MemorySocket) -> Vec<Value> {
    socket.take_frames().iter().map(|f| parse(f)).collect()
}

pub(crate) fn reply(conn: &Connection, path: &str, id: u64, value: Value) {
    conn.receive(json!({"path": path, "id": id, "return": value}).to_string());
}

pub(crate) fn request(conn: &Connection, path: &str, id: u64, method: &str, args: Value) {
    conn.receive(json!({"path": path, "id": id, "method": method, "args": args}).to_string());
}
