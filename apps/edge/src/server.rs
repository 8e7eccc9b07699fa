use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::{HeaderMap, Request, Response, StatusCode, Uri, header};
use axum::response::IntoResponse;
use bytes::Bytes;
use culvert_common::{Headers, TargetUrl, TunnelError, headers_to_wire};
use futures_util::stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::exchange::{start_client_socket, start_http_exchange};
use crate::registry::BackendRegistry;
use crate::routing::backend_id_for_host;
use crate::tunnel::TunnelConnection;

/// Runtime configuration of the edge node.
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    /// Serving domain; the label to its left selects the backend
    pub domain: String,
    /// Path on which backends connect their tunnels
    pub tunnel_path: String,
    /// Bound on time-to-first-byte for forwarded requests
    pub open_timeout: Duration,
}

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct EdgeState {
    pub registry: Arc<BackendRegistry>,
    pub config: Arc<EdgeConfig>,
}

/// Build the edge router: one catch-all handler sorts traffic into backend
/// tunnel connects, proxied upgrades, and proxied requests.
pub fn router(state: EdgeState) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(
    State(state): State<EdgeState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    request: Request<Body>,
) -> Response<Body> {
    let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
    else {
        return status_response(StatusCode::BAD_REQUEST, "Missing Host header");
    };

    // Reject hosts outside the serving domain before any registry lookup.
    let Some(backend_id) = backend_id_for_host(&host, &state.config.domain) else {
        debug!(%host, "Host outside serving domain");
        return status_response(StatusCode::MISDIRECTED_REQUEST, "Misdirected Request");
    };

    // Backends connect their tunnels on the configured path, claiming the
    // subdomain they dialed as their id.
    if request.uri().path() == state.config.tunnel_path {
        return match upgrade {
            Ok(upgrade) => accept_tunnel(state, backend_id, upgrade),
            Err(_) => status_response(
                StatusCode::UPGRADE_REQUIRED,
                "Tunnel endpoint expects a WebSocket",
            ),
        };
    }

    let Some(conn) = state.registry.resolve(&backend_id) else {
        debug!(%backend_id, "No backend for subdomain");
        return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
    };

    match upgrade {
        Ok(upgrade) => proxy_upgrade(conn, &host, upgrade, &request),
        Err(_) => proxy_request(&state, conn, &host, request).await,
    }
}

/// A new backend tunnel: install it (replacing any previous holder of the
/// id) and drive it until it disconnects.
fn accept_tunnel(state: EdgeState, backend_id: String, upgrade: WebSocketUpgrade) -> Response<Body> {
    upgrade
        .on_upgrade(move |socket| async move {
            info!(%backend_id, "Backend connected");
            let (conn, frame_rx) = TunnelConnection::new(backend_id);
            state.registry.register(conn.clone());
            conn.run(socket, frame_rx, state.registry.clone()).await;
        })
        .into_response()
}

/// Forward a public WebSocket upgrade through the backend's tunnel.
fn proxy_upgrade(
    conn: Arc<TunnelConnection>,
    host: &str,
    upgrade: WebSocketUpgrade,
    request: &Request<Body>,
) -> Response<Body> {
    let target = target_url(host, request.uri(), "ws:");
    let headers = wire_request_headers(request.headers());
    upgrade
        .on_upgrade(move |socket| async move {
            if let Err(e) =
                start_client_socket(conn.table().clone(), conn.sender(), target, headers, socket)
            {
                warn!("Failed to start socket exchange: {e}");
            }
        })
        .into_response()
}

/// Forward a public HTTP request through the backend's tunnel and stream
/// the tunneled response back.
async fn proxy_request(
    state: &EdgeState,
    conn: Arc<TunnelConnection>,
    host: &str,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();
    let target = target_url(host, &parts.uri, "http:");
    let headers = wire_request_headers(&parts.headers);

    let tunneled = match start_http_exchange(
        conn.table().clone(),
        conn.sender(),
        target,
        parts.method.to_string(),
        headers,
        body.into_data_stream(),
        state.config.open_timeout,
    ) {
        Ok(tunneled) => tunneled,
        Err(e) => {
            warn!("Failed to start http exchange: {e}");
            return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    match tunneled.head.await {
        Ok(head) => {
            let mut response = Response::new(Body::from_stream(ReceiverStream::new(tunneled.body)));
            *response.status_mut() = head.status;
            *response.headers_mut() = strip_hop_by_hop(&head.headers);
            response
        }
        // The exchange died before producing a head: abort rather than
        // answer with something made up.
        Err(_) => reset_response(),
    }
}

/// Public URL of the incoming request, split into wire components.
fn target_url(host: &str, uri: &Uri, protocol: &str) -> TargetUrl {
    let mut parts = host.splitn(2, ':');
    let _hostname = parts.next();
    let port = parts.next().unwrap_or_default();
    TargetUrl {
        pathname: uri.path().to_string(),
        search: uri.query().map(|q| format!("?{q}")).unwrap_or_default(),
        host: host.to_string(),
        port: port.to_string(),
        protocol: protocol.to_string(),
        username: String::new(),
        password: String::new(),
    }
}

/// Request headers as sent over the tunnel: hop-by-hop and handshake
/// headers stay on this hop, everything else passes through.
fn wire_request_headers(headers: &HeaderMap) -> Headers {
    headers_to_wire(&strip_hop_by_hop(headers))
}

/// Headers that belong to one hop and must not cross the tunnel. The
/// sec-websocket-* handshake headers are regenerated by whoever dials the
/// real socket.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-accept",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

fn status_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response
}

/// A response whose body fails immediately, aborting the client connection
/// instead of completing it.
fn reset_response() -> Response<Body> {
    let body = stream::once(async { Err::<Bytes, TunnelError>(TunnelError::TunnelClosed) });
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}
