use std::future::ready;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use culvert_common::{
    ExchangeHandle, ExchangeKind, ExchangeTable, Frame, Headers, RealSocket, Registration,
    TargetUrl, TunnelSender, generate_exchange_id, run_socket_exchange,
};

/// Accepted public WebSocket, adapted to the shared exchange machinery.
///
/// Text and binary messages are both carried as payload bytes; ping/pong
/// are answered by the library and never surface.
pub struct ClientSocket {
    inner: WebSocket,
}

impl ClientSocket {
    pub fn new(inner: WebSocket) -> Self {
        Self { inner }
    }
}

impl RealSocket for ClientSocket {
    async fn send(&mut self, data: Bytes) -> anyhow::Result<()> {
        self.inner
            .send(Message::Binary(data))
            .await
            .map_err(Into::into)
    }

    async fn recv(&mut self) -> Option<anyhow::Result<Bytes>> {
        loop {
            match self.inner.recv().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Text(text)) => return Some(Ok(Bytes::from(text.to_string()))),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.send(Message::Close(None)).await;
    }
}

/// Start a proxied WebSocket for an accepted public client socket.
///
/// Sends the open frame carrying the dial target and upgrade headers; the
/// socket on this side is already open, so the exchange never buffers.
pub fn start_client_socket(
    table: Arc<ExchangeTable>,
    tunnel: TunnelSender,
    target: TargetUrl,
    headers: Headers,
    socket: WebSocket,
) -> culvert_common::Result<()> {
    let id = generate_exchange_id();
    let (handle, inbox) = ExchangeHandle::new(id, ExchangeKind::Socket);
    // Register before the open frame goes out so inbound data frames
    // always find the exchange.
    let registration = Registration::register(table, handle);
    tunnel.send(Frame::socket_open(id, target, headers))?;

    tokio::spawn(run_socket_exchange(
        id,
        tunnel,
        inbox,
        ready(Ok(ClientSocket::new(socket))),
        registration,
    ));
    Ok(())
}
