mod socket;
mod upstream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use culvert_common::constants::{
    DEFAULT_TUNNEL_PATH, RECONNECT_MAX_DELAY_MS, RECONNECT_MIN_DELAY_MS, RECONNECT_MULTIPLIER,
};
use culvert_common::{
    ExchangeTable, Frame, RequestFrame, SocketFrame, TunnelSender, generate_backend_id,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};
use tracing::{debug, error, info};
use url::Url;

type TunnelSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Interval of transport-level pings keeping idle tunnels alive (seconds)
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// CLI arguments for the agent
#[derive(Parser, Debug)]
#[command(name = "culvert-agent")]
#[command(about = "Backend agent connecting a local service to a culvert edge", long_about = None)]
#[command(version)]
struct Args {
    /// Edge endpoint, e.g. ws://tunnel.example.com:8080
    #[arg(short, long, env = "CULVERT_ENDPOINT")]
    endpoint: String,

    /// Subdomain to claim; a fresh UUID when omitted
    #[arg(short, long, env = "CULVERT_ID")]
    id: Option<String>,

    /// Local service requests are forwarded to
    #[arg(
        short,
        long,
        env = "CULVERT_UPSTREAM",
        default_value = "http://127.0.0.1:3000"
    )]
    upstream: String,

    /// Path on which the edge accepts tunnels
    #[arg(long, env = "CULVERT_TUNNEL_PATH", default_value = DEFAULT_TUNNEL_PATH)]
    tunnel_path: String,

    /// Connect timeout in seconds for upstream HTTP calls
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct Config {
    /// Tunnel URL the agent dials, claimed subdomain included
    pub tunnel_url: Url,

    /// Claimed backend id (the subdomain)
    pub backend_id: String,

    /// Local service base URL
    pub upstream: Url,

    /// Connect timeout for upstream HTTP calls
    pub connect_timeout: Duration,

    /// Reconnection strategy
    pub reconnect: ReconnectConfig,
}

/// Reconnection configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Config {
    fn from_args(args: Args) -> Result<Self> {
        let backend_id = args.id.unwrap_or_else(generate_backend_id);
        let tunnel_url = tunnel_url(&args.endpoint, &backend_id, &args.tunnel_path)?;
        let upstream = Url::parse(&args.upstream).context("Invalid upstream URL")?;
        Ok(Self {
            tunnel_url,
            backend_id,
            upstream,
            connect_timeout: Duration::from_secs(args.connect_timeout),
            reconnect: ReconnectConfig {
                min_delay: Duration::from_millis(RECONNECT_MIN_DELAY_MS),
                max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
                multiplier: RECONNECT_MULTIPLIER,
            },
        })
    }
}

/// The claimed subdomain rides in the hostname the agent dials; the edge
/// reads it back off the Host header of the tunnel connect.
fn tunnel_url(endpoint: &str, backend_id: &str, tunnel_path: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint).context("Invalid endpoint URL")?;
    let host = url
        .host_str()
        .context("Endpoint URL needs a host")?
        .to_string();
    url.set_host(Some(&format!("{backend_id}.{host}")))
        .context("Cannot prefix subdomain onto endpoint host")?;
    url.set_path(tunnel_path);
    Ok(url)
}

/// Maintains the tunnel connection, reconnecting with exponential backoff.
pub struct ConnectionManager {
    config: Config,
    client: Client,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("Failed to build upstream client")?;
        Ok(Self { config, client })
    }

    /// Main run loop with automatic reconnection
    pub async fn run(&self) -> Result<()> {
        let mut delay = self.config.reconnect.min_delay;

        loop {
            match connect_async(self.config.tunnel_url.as_str()).await {
                Ok((socket, _)) => {
                    info!("Tunnel established as '{}'", self.config.backend_id);
                    delay = self.config.reconnect.min_delay;
                    self.handle_connection(socket).await;
                }
                Err(e) => {
                    error!("Failed to connect: {e}");
                }
            }

            info!("Reconnecting in {delay:?}");
            tokio::time::sleep(delay).await;

            // Exponential backoff
            delay = Duration::from_millis(
                ((delay.as_millis() as f64 * self.config.reconnect.multiplier)
                    .min(self.config.reconnect.max_delay.as_millis() as f64))
                    as u64,
            );
        }
    }

    /// Drive one live tunnel until it drops, then abort whatever it owns.
    async fn handle_connection(&self, socket: TunnelSocket) {
        let (sink, stream) = socket.split();
        let (tunnel, frame_rx) = TunnelSender::channel();
        let table = Arc::new(ExchangeTable::new());

        let writer = tokio::spawn(write_pump(sink, frame_rx));
        self.read_loop(stream, &table, &tunnel).await;

        // Tunnel gone: aborting every in-flight exchange drops upstream
        // calls and force-closes dialed sockets.
        table.abort_all();
        writer.abort();
    }

    async fn read_loop(
        &self,
        mut stream: SplitStream<TunnelSocket>,
        table: &Arc<ExchangeTable>,
        tunnel: &TunnelSender,
    ) {
        while let Some(message) = stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => self.dispatch(text.as_str(), table, tunnel),
                Ok(WsMessage::Close(_)) => {
                    info!("Edge closed the tunnel");
                    break;
                }
                Ok(_) => {} // ping/pong handled by the library, binary unused
                Err(e) => {
                    error!("Tunnel error: {e}");
                    break;
                }
            }
        }
    }

    /// Route one inbound frame: known ids go to their exchange, open
    /// frames start new responders, anything else is dropped.
    fn dispatch(&self, text: &str, table: &Arc<ExchangeTable>, tunnel: &TunnelSender) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping malformed frame: {e}");
                return;
            }
        };

        let id = frame.id;
        if table.contains(&id) {
            if !table.route(frame) {
                debug!(%id, "Dropping frame for dead exchange");
            }
        } else if frame.socket.as_ref().is_some_and(SocketFrame::is_open) {
            socket::start_socket_responder(frame, table, tunnel, &self.config.upstream);
        } else if frame.request.as_ref().is_some_and(RequestFrame::is_open) {
            upstream::start_http_responder(frame, table, tunnel, &self.client, &self.config.upstream);
        } else {
            debug!(%id, "Dropping frame for unknown exchange");
        }
    }
}

/// Write task: serialize queued frames onto the tunnel in queue order,
/// with periodic pings so idle tunnels survive intermediaries.
async fn write_pump(
    mut sink: SplitSink<TunnelSocket, WsMessage>,
    mut frame_rx: mpsc::UnboundedReceiver<Frame>,
) {
    let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    heartbeat.reset(); // skip the immediate first tick

    loop {
        tokio::select! {
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode frame: {e}");
                            continue;
                        }
                    };
                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                debug!("Sent heartbeat");
            }
        }
    }
    let _ = sink.close().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Culvert agent v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_args(args)?;
    info!("Upstream service: {}", config.upstream);
    info!("Tunnel endpoint: {}", config.tunnel_url);

    let manager = ConnectionManager::new(config)?;

    tokio::select! {
        result = manager.run() => {
            error!("Connection manager exited: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }

    Ok(())
}
