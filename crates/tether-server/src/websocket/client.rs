//! Client side of a session: dial a WebSocket server with `tokio-tungstenite`
//! and run a detached [`Connection`] over it.
//!
//! The client mounts its own [`HandlerTree`], so the server can call into it
//! exactly as it calls into the server.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tether_core::CallError;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::link::WsLink;
use crate::config::RpcConfig;
use crate::connection::{Connection, PeerInfo, ReplyFuture, Socket};
use crate::handlers::{HandlerRegistry, HandlerTree};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames buffered toward the writer before the socket reports unwritable.
const CLIENT_SEND_BUFFER: usize = 256;

/// Failure to establish a client session.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The WebSocket handshake failed.
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A live client session.
///
/// Dropping the session tears the connection down; [`ClientSession::close`]
/// does the same and also waits for the socket tasks to finish.
pub struct ClientSession {
    connection: Arc<Connection>,
    stop: CancellationToken,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// Connect to `url` and serve `handlers` to the remote side.
pub async fn connect(
    url: &str,
    handlers: HandlerTree,
    config: &RpcConfig,
) -> Result<ClientSession, ClientError> {
    let (ws, _) = connect_async(url).await?;
    info!(url, "connected");
    Ok(start(ws, url, handlers, config))
}

fn start(ws: WsStream, url: &str, handlers: HandlerTree, config: &RpcConfig) -> ClientSession {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, mut send_rx) = mpsc::channel::<String>(CLIENT_SEND_BUFFER);
    let link = Arc::new(WsLink::new(send_tx));
    let connection = Connection::open_detached(
        Arc::clone(&link) as Arc<dyn Socket>,
        PeerInfo::default().with_field("url", url),
        Arc::new(HandlerRegistry::new(handlers)),
        config,
    );
    let stop = CancellationToken::new();

    let writer_link = Arc::clone(&link);
    let writer_conn = Arc::clone(&connection);
    let writer_stop = stop.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        warn!(conn_id = %writer_conn.id(), error = %e, "websocket write failed");
                        break;
                    }
                    if writer_link.take_saturated() {
                        writer_conn.notify_writable();
                    }
                }
                () = writer_stop.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
        writer_stop.cancel();
    });

    let reader_conn = Arc::clone(&connection);
    let reader_stop = stop.clone();
    let reader = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = ws_rx.next() => msg,
                () = reader_stop.cancelled() => break,
            };
            let msg = match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    debug!(conn_id = %reader_conn.id(), error = %e, "websocket read failed");
                    break;
                }
                None => break,
            };
            link.mark_alive();
            match msg {
                Message::Text(text) => reader_conn.receive(text.to_string()),
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => reader_conn.receive(text),
                    Err(_) => debug!(conn_id = %reader_conn.id(), len = data.len(), "received non-UTF8 binary frame"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
        reader_conn.teardown();
        reader_stop.cancel();
    });

    ClientSession {
        connection,
        stop,
        reader: Some(reader),
        writer: Some(writer),
    }
}

impl ClientSession {
    /// The underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Call `path.method` on the server.
    pub fn call(&self, path: &str, method: &str, args: Vec<Value>) -> ReplyFuture {
        self.connection.call(path, method, args)
    }

    /// Call `path.method` on the server and wait for the outcome.
    pub async fn request(&self, path: &str, method: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.call(path, method, args).await
    }

    /// Whether the session is still up.
    pub fn is_open(&self) -> bool {
        self.connection.is_open() && !self.stop.is_cancelled()
    }

    /// Wait until the server closes the session.
    pub async fn closed(&self) {
        self.stop.cancelled().await;
    }

    /// Close the session and wait for the socket tasks to finish.
    pub async fn close(mut self) {
        self.stop.cancel();
        self.connection.teardown();
        for handle in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            let _ = handle.await;
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.stop.cancel();
        self.connection.teardown();
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("connection", &self.connection.id())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
