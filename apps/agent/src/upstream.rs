use std::sync::Arc;

use bytes::Bytes;
use culvert_common::constants::BODY_CHANNEL_CAPACITY;
use culvert_common::{
    BodyState, ExchangeHandle, ExchangeKind, ExchangeMsg, ExchangeTable, Frame, Headers,
    Registration, RequestFrame, TunnelError, TunnelSender, decode_chunk, headers_to_wire,
    wire_to_headers,
};
use futures_util::StreamExt;
use reqwest::{Client, Method, header};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

/// Start the responder side of one forwarded HTTP request.
///
/// Registers under the initiator's correlation id, performs the real call
/// against the local upstream, and streams the response back as head,
/// chunks, end.
pub fn start_http_responder(
    frame: Frame,
    table: &Arc<ExchangeTable>,
    tunnel: &TunnelSender,
    client: &Client,
    upstream: &Url,
) {
    let id = frame.id;
    let Some(request) = frame.request else {
        return;
    };
    let (handle, inbox) = ExchangeHandle::new(id, ExchangeKind::Http);
    let registration = Registration::register(table.clone(), handle);
    tokio::spawn(run(
        id,
        request,
        inbox,
        registration,
        tunnel.clone(),
        client.clone(),
        upstream.clone(),
    ));
}

async fn run(
    id: Uuid,
    request: RequestFrame,
    mut inbox: mpsc::UnboundedReceiver<ExchangeMsg>,
    registration: Registration,
    tunnel: TunnelSender,
    client: Client,
    upstream: Url,
) {
    // Dropping the guard on any exit path deregisters this exchange.
    let _registration = registration;

    let (Some(target), Some(method)) = (request.url, request.method) else {
        debug!(%id, "Dropping request open frame without target");
        return;
    };

    let url = match target.rebase(&upstream) {
        Ok(url) => url,
        Err(e) => {
            send_error(&tunnel, id, &format!("Bad request target: {e}"));
            return;
        }
    };
    let method = match Method::from_bytes(method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            send_error(&tunnel, id, &format!("Unsupported method: {method}"));
            return;
        }
    };

    let mut headers = wire_to_headers(&request.headers.unwrap_or_default());
    // The initiator forwarded the public host; this call goes to the
    // upstream, which names itself.
    headers.remove(header::HOST);

    debug!(%id, %method, %url, "Forwarding request upstream");

    let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, TunnelError>>(BODY_CHANNEL_CAPACITY);
    let call = client
        .request(method, url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(ReceiverStream::new(body_rx)))
        .send();
    tokio::pin!(call);

    // Feed request body frames into the call while awaiting its head.
    let mut body_tx = Some(body_tx);
    let result = loop {
        tokio::select! {
            result = &mut call => break result,
            msg = inbox.recv() => match msg {
                Some(ExchangeMsg::Frame(frame)) => {
                    apply_request_frame(id, frame, &mut body_tx).await;
                }
                Some(ExchangeMsg::Abort) | None => {
                    debug!(%id, "Responder aborted, dropping upstream call");
                    return;
                }
            },
        }
    };

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            // The dial or call failed before any head: synthesize a 500 so
            // the initiator completes normally instead of timing out.
            warn!(%id, "Upstream call failed: {e}");
            send_error(&tunnel, id, &e.to_string());
            return;
        }
    };

    let status = response.status();
    let reason = status.canonical_reason().unwrap_or_default();
    let head = Frame::response_open(id, status.as_u16(), reason, headers_to_wire(response.headers()));
    if tunnel.send(head).is_err() {
        return;
    }

    let mut body = response.bytes_stream();
    loop {
        tokio::select! {
            chunk = body.next() => match chunk {
                Some(Ok(data)) => {
                    if tunnel.send(Frame::response_chunk(id, &data)).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    debug!(%id, "Upstream body failed mid-stream: {e}");
                    break;
                }
                None => break,
            },
            // Late request body frames (an upstream may answer before the
            // request body finishes) keep flowing into the call.
            msg = inbox.recv() => match msg {
                Some(ExchangeMsg::Frame(frame)) => {
                    apply_request_frame(id, frame, &mut body_tx).await;
                }
                Some(ExchangeMsg::Abort) | None => return,
            },
        }
    }

    let _ = tunnel.send(Frame::response_end(id));
    debug!(%id, "Responder complete");
}

/// Feed one inbound request frame into the upstream call's body stream.
async fn apply_request_frame(
    id: Uuid,
    frame: Frame,
    body_tx: &mut Option<mpsc::Sender<Result<Bytes, TunnelError>>>,
) {
    let Some(request) = frame.request else {
        debug!(%id, "Dropping non-request frame on responder");
        return;
    };
    match request.body_state() {
        BodyState::Chunk(encoded) => match decode_chunk(encoded) {
            Ok(data) => {
                if let Some(tx) = body_tx {
                    let _ = tx.send(Ok(data)).await;
                }
            }
            Err(e) => debug!(%id, "Dropping undecodable request chunk: {e}"),
        },
        // Closing the channel ends the upstream request body; nothing is
        // legal on the request side afterwards.
        BodyState::End => {
            body_tx.take();
        }
        BodyState::Open => debug!(%id, "Dropping duplicate request open frame"),
    }
}

/// Synthetic 500: head, the error text as the single body chunk, end.
fn send_error(tunnel: &TunnelSender, id: Uuid, message: &str) {
    let _ = tunnel.send(Frame::response_open(id, 500, "Internal Server Error", Headers::new()));
    let _ = tunnel.send(Frame::response_chunk(id, message.as_bytes()));
    let _ = tunnel.send(Frame::response_end(id));
}
