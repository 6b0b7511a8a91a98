//! WebSocket session lifecycle: handles a single accepted socket from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::link::WsLink;
use crate::connection::{PeerInfo, Socket};
use crate::metrics::{WS_CONNECTION_DURATION_SECONDS, WS_DISCONNECTIONS_TOTAL};
use crate::server::Server;

/// Per-session transport settings.
#[derive(Clone, Copy, Debug)]
pub struct SessionSettings {
    /// Interval between server-initiated Ping frames.
    pub ping_interval: Duration,
    /// Silence after which the peer is considered dead.
    pub pong_timeout: Duration,
    /// Frames buffered toward the writer before the socket is unwritable.
    pub send_buffer: usize,
}

/// Run a WebSocket session for an accepted socket.
///
/// 1. Registers the socket as a new connection of `server`
/// 2. Feeds incoming text (or UTF-8 binary) frames into the connection
/// 3. Forwards outbound frames and sends periodic Ping frames
/// 4. Tears the connection down when the socket closes, the peer goes
///    silent, or `shutdown` fires
#[instrument(skip_all)]
pub async fn run_ws_session(
    ws: WebSocket,
    server: Arc<Server>,
    peer: PeerInfo,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<String>(settings.send_buffer.max(1));
    let link = Arc::new(WsLink::new(send_tx));
    let connection = server.accept(Arc::clone(&link) as Arc<dyn Socket>, peer);
    let conn_id = connection.id().clone();
    let connection_start = Instant::now();

    // Outbound forwarder with periodic Ping frames.
    let outbound_link = Arc::clone(&link);
    let outbound_conn = Arc::clone(&connection);
    let mut outbound = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(settings.ping_interval);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                    if outbound_link.take_saturated() {
                        outbound_conn.notify_writable();
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_link.check_alive()
                        && outbound_link.last_seen_elapsed() > settings.pong_timeout
                    {
                        warn!(conn_id = %outbound_conn.id(), "peer unresponsive for {:?}, disconnecting", settings.pong_timeout);
                        break;
                    }
                    if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            () = shutdown.cancelled() => {
                debug!(conn_id = %conn_id, "shutdown requested, closing session");
                break;
            }
            _ = &mut outbound => {
                debug!(conn_id = %conn_id, "writer finished, closing session");
                break;
            }
        };
        let Some(Ok(msg)) = msg else { break };
        link.mark_alive();

        // Peers may send text as binary frames
        match msg {
            Message::Text(text) => connection.receive(text.to_string()),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => connection.receive(text.to_owned()),
                Err(_) => info!(conn_id = %conn_id, len = data.len(), "received non-UTF8 binary frame"),
            },
            Message::Close(_) => {
                info!(conn_id = %conn_id, "peer sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    connection.teardown();
    outbound.abort();
    info!(conn_id = %conn_id, "peer disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
}
