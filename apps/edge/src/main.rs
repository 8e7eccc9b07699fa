use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use culvert_common::constants::{DEFAULT_TUNNEL_PATH, OPEN_TIMEOUT_SECS};
use culvert_edge::registry::BackendRegistry;
use culvert_edge::server::{EdgeConfig, EdgeState, router};
use tracing::{error, info};

/// CLI arguments for the edge node
#[derive(Parser, Debug)]
#[command(name = "culvert-edge")]
#[command(about = "Public edge node forwarding subdomain traffic over backend tunnels", long_about = None)]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Serving domain; subdomains of it select backends
    #[arg(short, long, env = "CULVERT_DOMAIN")]
    domain: String,

    /// Path on which backends connect their tunnels
    #[arg(long, env = "CULVERT_TUNNEL_PATH", default_value = DEFAULT_TUNNEL_PATH)]
    tunnel_path: String,

    /// Seconds allowed until the first response frame of a forwarded request
    #[arg(long, default_value_t = OPEN_TIMEOUT_SECS)]
    open_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
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

    info!("Culvert edge v{}", env!("CARGO_PKG_VERSION"));
    info!("Serving domain: {}", args.domain);
    info!("Tunnel path: {}", args.tunnel_path);

    let state = EdgeState {
        registry: Arc::new(BackendRegistry::new()),
        config: Arc::new(EdgeConfig {
            domain: args.domain,
            tunnel_path: args.tunnel_path,
            open_timeout: Duration::from_secs(args.open_timeout),
        }),
    };

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!("Listening on {}", args.listen);

    tokio::select! {
        result = axum::serve(listener, router(state)).into_future() => {
            error!("Listener exited: {:?}", result);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
        }
    }

    Ok(())
}
