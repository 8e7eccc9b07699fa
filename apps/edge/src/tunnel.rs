use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use culvert_common::{ExchangeTable, Frame, TunnelSender};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::BackendRegistry;

/// Edge-side half of one backend tunnel.
///
/// Owns the table of in-flight exchanges for this backend, routes inbound
/// frames to them by correlation id, and queues outbound frames for the
/// single writer task. Destroying the connection aborts every owned
/// exchange; no exchange survives its connection.
#[derive(Debug)]
pub struct TunnelConnection {
    backend_id: String,
    /// Distinguishes this connection from a replacement claiming the same
    /// backend id (conditional unregister).
    token: Uuid,
    table: Arc<ExchangeTable>,
    sender: TunnelSender,
    shutdown: Notify,
}

impl TunnelConnection {
    /// Create a connection for a backend claiming `backend_id`, plus the
    /// receiving half of its outbound frame queue.
    pub fn new(backend_id: String) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (sender, frame_rx) = TunnelSender::channel();
        let conn = Arc::new(Self {
            backend_id,
            token: Uuid::new_v4(),
            table: Arc::new(ExchangeTable::new()),
            sender,
            shutdown: Notify::new(),
        });
        (conn, frame_rx)
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn table(&self) -> &Arc<ExchangeTable> {
        &self.table
    }

    pub fn sender(&self) -> TunnelSender {
        self.sender.clone()
    }

    /// Abort every owned exchange and wake the read loop so it closes the
    /// socket. Idempotent; called on duplicate-id takeover and on normal
    /// teardown.
    pub fn destroy(&self) {
        self.table.abort_all();
        self.shutdown.notify_waiters();
    }

    /// Drive the tunnel until the backend disconnects or the connection is
    /// destroyed, then tear down whatever it still owns.
    pub async fn run(
        self: Arc<Self>,
        socket: WebSocket,
        frame_rx: mpsc::UnboundedReceiver<Frame>,
        registry: Arc<BackendRegistry>,
    ) {
        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_pump(sink, frame_rx));

        self.read_loop(stream).await;

        info!(backend_id = %self.backend_id, "Backend disconnected");
        self.destroy();
        registry.unregister(&self.backend_id, &self);
        writer.abort();
    }

    async fn read_loop(&self, mut stream: SplitStream<WebSocket>) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!(backend_id = %self.backend_id, "Tunnel shut down");
                    break;
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by the library, binary unused
                    Some(Err(e)) => {
                        warn!(backend_id = %self.backend_id, "Tunnel read error: {e}");
                        break;
                    }
                },
            }
        }
    }

    /// Route one inbound frame to the exchange that owns it. Malformed
    /// frames and frames for unknown ids are dropped without affecting the
    /// connection.
    pub fn dispatch(&self, text: &str) {
        match Frame::decode(text) {
            Ok(frame) => {
                let id = frame.id;
                if !self.table.route(frame) {
                    debug!(backend_id = %self.backend_id, %id, "Dropping frame for unknown exchange");
                }
            }
            Err(e) => {
                debug!(backend_id = %self.backend_id, "Dropping malformed frame: {e}");
            }
        }
    }
}

/// Serialize queued frames onto the socket, preserving queue order.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut frame_rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = frame_rx.recv().await {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode frame: {e}");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
