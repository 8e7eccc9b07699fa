use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use culvert_common::constants::BODY_CHANNEL_CAPACITY;
use culvert_common::{
    BodyState, ExchangeHandle, ExchangeKind, ExchangeMsg, ExchangeTable, Frame, Headers,
    Registration, ResponseFrame, TargetUrl, TunnelError, TunnelSender, decode_chunk,
    generate_exchange_id, wire_to_headers,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Status line and headers of a tunneled response, delivered at most once.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// What the listener gets back for a started exchange.
///
/// The head arrives at most once, then body chunks until the channel
/// closes. A closed head channel with nothing delivered, or an `Err` body
/// item, means the exchange was torn down and the client connection should
/// be reset rather than completed.
#[derive(Debug)]
pub struct TunneledResponse {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<Result<Bytes, TunnelError>>,
}

/// Start one forwarded HTTP request/response cycle.
///
/// Registers a fresh exchange id, sends the open frame, and spawns the
/// task that pumps the request body into the tunnel while driving the
/// response state machine (AwaitingOpen → Streaming → Ended). The timeout
/// bounds time to the first response frame only; streaming afterwards is
/// unbounded.
pub fn start_http_exchange<S, E>(
    table: Arc<ExchangeTable>,
    tunnel: TunnelSender,
    target: TargetUrl,
    method: String,
    headers: Headers,
    request_body: S,
    open_timeout: Duration,
) -> culvert_common::Result<TunneledResponse>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let id = generate_exchange_id();
    let (handle, inbox) = ExchangeHandle::new(id, ExchangeKind::Http);
    // Register before the open frame goes out: the backend's response
    // must always find the exchange in the table.
    let registration = Registration::register(table, handle);
    tunnel.send(Frame::request_open(id, target, method, headers))?;

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    tokio::spawn(run(
        id,
        tunnel,
        inbox,
        registration,
        request_body,
        head_tx,
        body_tx,
        open_timeout,
    ));

    Ok(TunneledResponse {
        head: head_rx,
        body: body_rx,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run<S, E>(
    id: Uuid,
    tunnel: TunnelSender,
    mut inbox: mpsc::UnboundedReceiver<ExchangeMsg>,
    registration: Registration,
    mut request_body: S,
    head_tx: oneshot::Sender<ResponseHead>,
    body_tx: mpsc::Sender<Result<Bytes, TunnelError>>,
    open_timeout: Duration,
) where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    // Dropping the guard on any exit path deregisters this exchange.
    let _registration = registration;

    let mut head_tx = Some(head_tx);
    let mut request_done = false;
    let open_deadline = tokio::time::sleep(open_timeout);
    tokio::pin!(open_deadline);

    loop {
        let awaiting_open = head_tx.is_some();
        tokio::select! {
            msg = inbox.recv() => match msg {
                Some(ExchangeMsg::Frame(frame)) => {
                    let Some(response) = frame.response else {
                        debug!(%id, "Dropping non-response frame");
                        continue;
                    };
                    match handle_response(id, response, &mut head_tx, &body_tx).await {
                        Flow::Continue => {}
                        Flow::Done => {
                            debug!(%id, "Exchange complete");
                            return;
                        }
                        Flow::ClientGone => {
                            debug!(%id, "Client went away, tearing down");
                            return;
                        }
                    }
                }
                Some(ExchangeMsg::Abort) | None => {
                    reset(id, head_tx, &body_tx).await;
                    return;
                }
            },

            chunk = request_body.next(), if !request_done => match chunk {
                Some(Ok(data)) => {
                    if tunnel.send(Frame::request_chunk(id, &data)).is_err() {
                        reset(id, head_tx, &body_tx).await;
                        return;
                    }
                }
                Some(Err(e)) => {
                    debug!(%id, "Request body failed, tearing down: {e}");
                    return;
                }
                None => {
                    // Exactly one end frame; no request frame is legal after it.
                    let _ = tunnel.send(Frame::request_end(id));
                    request_done = true;
                }
            },

            // Bounds time-to-first-byte only; disarmed once the head arrives.
            _ = &mut open_deadline, if awaiting_open => {
                warn!(%id, "No response within {open_timeout:?}, answering 504");
                if let Some(tx) = head_tx.take() {
                    let _ = tx.send(ResponseHead {
                        status: StatusCode::GATEWAY_TIMEOUT,
                        headers: HeaderMap::new(),
                    });
                }
                return;
            }
        }
    }
}

enum Flow {
    Continue,
    Done,
    ClientGone,
}

/// Apply one response frame according to the three-state body contract.
async fn handle_response(
    id: Uuid,
    response: ResponseFrame,
    head_tx: &mut Option<oneshot::Sender<ResponseHead>>,
    body_tx: &mpsc::Sender<Result<Bytes, TunnelError>>,
) -> Flow {
    match response.body_state() {
        BodyState::Open => {
            let Some(tx) = head_tx.take() else {
                debug!(%id, "Dropping duplicate response head");
                return Flow::Continue;
            };
            let Some(status) = response
                .status_code
                .and_then(|code| StatusCode::from_u16(code).ok())
            else {
                debug!(%id, "Dropping response head without usable status");
                *head_tx = Some(tx);
                return Flow::Continue;
            };
            let headers = response
                .headers
                .as_ref()
                .map(wire_to_headers)
                .unwrap_or_default();
            match tx.send(ResponseHead { status, headers }) {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::ClientGone,
            }
        }
        BodyState::Chunk(encoded) => {
            if head_tx.is_some() {
                debug!(%id, "Dropping body chunk before response head");
                return Flow::Continue;
            }
            let data = match decode_chunk(encoded) {
                Ok(data) => data,
                Err(e) => {
                    debug!(%id, "Dropping undecodable body chunk: {e}");
                    return Flow::Continue;
                }
            };
            match body_tx.send(Ok(data)).await {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::ClientGone,
            }
        }
        BodyState::End => {
            if head_tx.is_some() {
                // End before any head: nothing useful can be delivered.
                warn!(%id, "Response ended before its head, resetting client");
            }
            // Dropping body_tx (with the whole task) finalizes the
            // downstream connection; the registration guard deregisters.
            Flow::Done
        }
    }
}

/// Tear down toward the client: reset rather than complete.
async fn reset(
    id: Uuid,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: &mpsc::Sender<Result<Bytes, TunnelError>>,
) {
    debug!(%id, "Resetting client connection");
    match head_tx {
        // Head not sent yet: dropping the sender tells the listener to
        // abort instead of answering.
        Some(tx) => drop(tx),
        // Mid-stream: an error item makes the body stream abort the
        // connection instead of ending it cleanly.
        None => {
            let _ = body_tx.send(Err(TunnelError::TunnelClosed)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use culvert_common::Headers;
    use futures_util::stream;
    use std::convert::Infallible;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::timeout;

    fn target() -> TargetUrl {
        TargetUrl {
            pathname: "/foo".to_string(),
            host: "abc.tunnel.example.com".to_string(),
            protocol: "http:".to_string(),
            ..Default::default()
        }
    }

    fn empty_body() -> stream::Iter<std::vec::IntoIter<Result<Bytes, Infallible>>> {
        stream::iter(Vec::new())
    }

    struct Exchange {
        id: Uuid,
        table: Arc<ExchangeTable>,
        tunnel_rx: mpsc::UnboundedReceiver<Frame>,
        response: TunneledResponse,
    }

    fn start<S, E>(body: S, open_timeout: Duration) -> Exchange
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let table = Arc::new(ExchangeTable::new());
        let (tunnel, mut tunnel_rx) = TunnelSender::channel();
        let response = start_http_exchange(
            table.clone(),
            tunnel,
            target(),
            "GET".to_string(),
            Headers::new(),
            body,
            open_timeout,
        )
        .unwrap();

        // The open frame goes out synchronously at construction.
        let open = tunnel_rx.try_recv().unwrap();
        assert!(open.request.as_ref().unwrap().is_open());
        Exchange {
            id: open.id,
            table,
            tunnel_rx,
            response,
        }
    }

    fn deliver(exchange: &Exchange, frame: Frame) {
        assert!(exchange.table.route(frame));
    }

    async fn collect_body(response: &mut TunneledResponse) -> Vec<u8> {
        let mut collected = Vec::new();
        while let Some(item) = response.body.recv().await {
            collected.extend_from_slice(&item.unwrap());
        }
        collected
    }

    #[tokio::test]
    async fn test_chunked_response_delivered_in_order() {
        // Scenario: 200 with two chunks then end -> body "hello", once.
        let mut exchange = start(empty_body(), Duration::from_secs(30));
        let id = exchange.id;

        let mut headers = Headers::new();
        headers.insert("content-type".to_string(), vec!["text/plain".to_string()]);
        deliver(&exchange, Frame::response_open(id, 200, "OK", headers));
        deliver(&exchange, Frame::response_chunk(id, b"hel"));
        deliver(&exchange, Frame::response_chunk(id, b"lo"));
        deliver(&exchange, Frame::response_end(id));

        let head = (&mut exchange.response.head).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers.get("content-type").unwrap(), "text/plain");

        assert_eq!(collect_body(&mut exchange.response).await, b"hello");

        // Completion deregisters exactly once; later frames find nothing.
        timeout(Duration::from_secs(1), async {
            while !exchange.table.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!exchange.table.route(Frame::response_chunk(id, b"late")));
    }

    #[tokio::test]
    async fn test_request_body_framed_as_chunks_then_single_end() {
        let body = stream::iter(vec![
            Ok::<_, Infallible>(Bytes::from("par")),
            Ok(Bytes::from("tial")),
        ]);
        let mut exchange = start(body, Duration::from_secs(30));
        let id = exchange.id;

        // The whole request body goes out before any response arrives.
        let chunk1 = exchange.tunnel_rx.recv().await.unwrap();
        let chunk2 = exchange.tunnel_rx.recv().await.unwrap();
        let end = exchange.tunnel_rx.recv().await.unwrap();
        assert_eq!(chunk1, Frame::request_chunk(id, b"par"));
        assert_eq!(chunk2, Frame::request_chunk(id, b"tial"));
        assert_eq!(end, Frame::request_end(id));

        deliver(&exchange, Frame::response_open(id, 204, "No Content", Headers::new()));
        deliver(&exchange, Frame::response_end(id));
        let _ = (&mut exchange.response.head).await.unwrap();
        assert!(collect_body(&mut exchange.response).await.is_empty());
        assert!(matches!(
            exchange.tunnel_rx.try_recv(),
            Err(TryRecvError::Empty | TryRecvError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_answers_504_and_releases_exchange() {
        let mut exchange = start(empty_body(), Duration::from_secs(30));

        // Consume the request-end frame so only the timer remains.
        let _ = exchange.tunnel_rx.recv().await.unwrap();

        let head = (&mut exchange.response.head).await.unwrap();
        assert_eq!(head.status, StatusCode::GATEWAY_TIMEOUT);
        assert!(collect_body(&mut exchange.response).await.is_empty());

        timeout(Duration::from_secs(1), async {
            while !exchange.table.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_head_disarms_timeout() {
        let mut exchange = start(empty_body(), Duration::from_secs(30));
        let id = exchange.id;

        deliver(&exchange, Frame::response_open(id, 200, "OK", Headers::new()));
        let head = (&mut exchange.response.head).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);

        // Well past the open timeout, the exchange still streams.
        tokio::time::advance(Duration::from_secs(120)).await;
        deliver(&exchange, Frame::response_chunk(id, b"slow"));
        let item = exchange.response.body.recv().await.unwrap().unwrap();
        assert_eq!(item, Bytes::from("slow"));
    }

    #[tokio::test]
    async fn test_abort_mid_stream_resets_client() {
        let mut exchange = start(empty_body(), Duration::from_secs(30));
        let id = exchange.id;

        deliver(&exchange, Frame::response_open(id, 200, "OK", Headers::new()));
        deliver(&exchange, Frame::response_chunk(id, b"hel"));
        let _ = (&mut exchange.response.head).await.unwrap();

        exchange.table.abort_all();

        let mut saw_reset = false;
        while let Some(item) = exchange.response.body.recv().await {
            match item {
                Ok(_) => {}
                Err(e) => {
                    assert!(matches!(e, TunnelError::TunnelClosed));
                    saw_reset = true;
                }
            }
        }
        assert!(saw_reset);
    }

    #[tokio::test]
    async fn test_abort_before_head_drops_head_channel() {
        let mut exchange = start(empty_body(), Duration::from_secs(30));

        exchange.table.abort_all();
        assert!((&mut exchange.response.head).await.is_err());
    }

    #[tokio::test]
    async fn test_chunk_before_head_is_dropped() {
        let mut exchange = start(empty_body(), Duration::from_secs(30));
        let id = exchange.id;

        deliver(&exchange, Frame::response_chunk(id, b"early"));
        deliver(&exchange, Frame::response_open(id, 200, "OK", Headers::new()));
        deliver(&exchange, Frame::response_chunk(id, b"kept"));
        deliver(&exchange, Frame::response_end(id));

        let _ = (&mut exchange.response.head).await.unwrap();
        assert_eq!(collect_body(&mut exchange.response).await, b"kept");
    }

    #[tokio::test]
    async fn test_duplicate_head_is_dropped() {
        let mut exchange = start(empty_body(), Duration::from_secs(30));
        let id = exchange.id;

        deliver(&exchange, Frame::response_open(id, 200, "OK", Headers::new()));
        deliver(&exchange, Frame::response_open(id, 500, "Nope", Headers::new()));
        deliver(&exchange, Frame::response_end(id));

        let head = (&mut exchange.response.head).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert!(collect_body(&mut exchange.response).await.is_empty());
    }
}
