use std::future::Future;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::exchange::{ExchangeMsg, Registration};
use crate::protocol::Frame;
use crate::tunnel::TunnelSender;
use crate::utils::decode_chunk;

/// One terminal of a proxied WebSocket: whatever actually speaks the
/// WebSocket protocol on this side. On the edge that is the accepted client
/// socket; on the agent it is the socket dialed to the upstream service.
///
/// Implementations handle control frames (ping/pong/close) themselves and
/// surface only data messages.
pub trait RealSocket {
    /// Write one message to the socket.
    fn send(&mut self, data: Bytes) -> impl Future<Output = anyhow::Result<()>>;

    /// Next data message; `None` once the socket has closed.
    fn recv(&mut self) -> impl Future<Output = Option<anyhow::Result<Bytes>>>;

    /// Close the socket.
    fn close(&mut self) -> impl Future<Output = ()>;
}

/// Drive one proxied WebSocket until either endpoint closes.
///
/// `dial` resolves to the real socket. Frames that arrive from the tunnel
/// while it is still pending are buffered in arrival order and flushed the
/// moment the socket opens; from then on frames are written through
/// directly and buffering never happens again.
///
/// There is no close signal on the wire: a closed real socket tears down
/// this exchange only, and an aborted exchange (tunnel loss, backend
/// takeover) force-closes the real socket so it cannot leak.
pub async fn run_socket_exchange<S, F>(
    id: Uuid,
    tunnel: TunnelSender,
    mut inbox: mpsc::UnboundedReceiver<ExchangeMsg>,
    dial: F,
    registration: Registration,
) where
    S: RealSocket,
    F: Future<Output = anyhow::Result<S>>,
{
    // Dropping the guard on any exit path deregisters this exchange.
    let _registration = registration;

    // Connecting: buffer inbound payloads until the dial resolves.
    let mut buffered: Vec<Bytes> = Vec::new();
    let mut socket = {
        tokio::pin!(dial);
        loop {
            tokio::select! {
                result = &mut dial => match result {
                    Ok(socket) => break socket,
                    Err(e) => {
                        debug!(%id, "Socket dial failed: {e}");
                        return;
                    }
                },
                msg = inbox.recv() => match msg {
                    Some(ExchangeMsg::Frame(frame)) => {
                        if let Some(data) = socket_payload(&frame) {
                            buffered.push(data);
                        }
                    }
                    Some(ExchangeMsg::Abort) | None => return,
                },
            }
        }
    };

    // Open: replay the buffer in arrival order before anything else.
    debug!(%id, buffered = buffered.len(), "Socket open");
    for data in buffered.drain(..) {
        if let Err(e) = socket.send(data).await {
            debug!(%id, "Socket write failed during flush: {e}");
            socket.close().await;
            return;
        }
    }

    loop {
        tokio::select! {
            msg = inbox.recv() => match msg {
                Some(ExchangeMsg::Frame(frame)) => {
                    if let Some(data) = socket_payload(&frame) {
                        if let Err(e) = socket.send(data).await {
                            debug!(%id, "Socket write failed: {e}");
                            break;
                        }
                    }
                }
                Some(ExchangeMsg::Abort) | None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(data)) => {
                    if tunnel.send(Frame::socket_message(id, &data)).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(%id, "Socket read failed: {e}");
                    break;
                }
                None => {
                    debug!(%id, "Socket closed by peer");
                    break;
                }
            },
        }
    }

    socket.close().await;
}

/// Payload of a `{socket:{message}}` frame; malformed frames yield nothing.
fn socket_payload(frame: &Frame) -> Option<Bytes> {
    let message = frame.socket.as_ref()?.message.as_deref()?;
    match decode_chunk(message) {
        Ok(data) => Some(data),
        Err(e) => {
            debug!(id = %frame.id, "Dropping undecodable socket frame: {e}");
            None
        }
    }
}
