use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use culvert_common::{
    ExchangeHandle, ExchangeKind, ExchangeTable, Frame, RealSocket, Registration, TargetUrl,
    TunnelSender, run_socket_exchange,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

/// Dialed upstream WebSocket, adapted to the shared exchange machinery.
pub struct UpstreamSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RealSocket for UpstreamSocket {
    async fn send(&mut self, data: Bytes) -> anyhow::Result<()> {
        self.inner
            .send(WsMessage::Binary(data))
            .await
            .map_err(Into::into)
    }

    async fn recv(&mut self) -> Option<anyhow::Result<Bytes>> {
        loop {
            match self.inner.next().await? {
                Ok(WsMessage::Binary(data)) => return Some(Ok(data)),
                Ok(WsMessage::Text(text)) => return Some(Ok(Bytes::from(text.to_string()))),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue, // ping/pong handled by the library
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

/// Start the responder side of one proxied WebSocket.
///
/// Registers under the initiator's id and dials the upstream; the shared
/// state machine buffers tunnel frames until the dial resolves, then
/// relays in both directions.
pub fn start_socket_responder(
    frame: Frame,
    table: &Arc<ExchangeTable>,
    tunnel: &TunnelSender,
    upstream: &Url,
) {
    let id = frame.id;
    let Some(target) = frame.socket.and_then(|socket| socket.url) else {
        return;
    };
    let (handle, inbox) = ExchangeHandle::new(id, ExchangeKind::Socket);
    let registration = Registration::register(table.clone(), handle);

    let upstream = upstream.clone();
    let dial = async move {
        let url = socket_target(&target, &upstream)?;
        debug!(%id, %url, "Dialing upstream socket");
        let (socket, _) = connect_async(url.as_str()).await?;
        Ok(UpstreamSocket { inner: socket })
    };
    tokio::spawn(run_socket_exchange(
        id,
        tunnel.clone(),
        inbox,
        dial,
        registration,
    ));
}

/// Upstream URL for a socket dial: the upstream's authority with the
/// frame's path and query, on the matching WebSocket scheme.
fn socket_target(target: &TargetUrl, upstream: &Url) -> anyhow::Result<Url> {
    let mut base = upstream.clone();
    let scheme = match upstream.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    base.set_scheme(scheme)
        .map_err(|_| anyhow!("Upstream URL cannot carry a WebSocket scheme"))?;
    Ok(target.rebase(&base)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_target_switches_to_ws_scheme() {
        let upstream = Url::parse("http://127.0.0.1:3000").unwrap();
        let target = TargetUrl {
            pathname: "/live".to_string(),
            search: "?room=1".to_string(),
            protocol: "ws:".to_string(),
            ..Default::default()
        };
        let url = socket_target(&target, &upstream).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:3000/live?room=1");
    }

    #[test]
    fn test_socket_target_keeps_tls() {
        let upstream = Url::parse("https://service.internal:8443/").unwrap();
        let target = TargetUrl {
            pathname: "/feed".to_string(),
            ..Default::default()
        };
        let url = socket_target(&target, &upstream).unwrap();
        assert_eq!(url.as_str(), "wss://service.internal:8443/feed");
    }

    #[test]
    fn test_open_frame_without_target_is_dropped() {
        let table = Arc::new(ExchangeTable::new());
        let (tunnel, _rx) = TunnelSender::channel();
        let upstream = Url::parse("http://127.0.0.1:3000").unwrap();

        let frame = Frame::socket_message(uuid::Uuid::new_v4(), b"data");
        start_socket_responder(frame, &table, &tunnel, &upstream);
        assert!(table.is_empty());
    }
}
