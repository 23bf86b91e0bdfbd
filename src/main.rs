//! RPC multiplexing gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────┐
//!                        │                    GATEWAY                        │
//!   WebSocket            │  ┌─────────┐   ┌──────────┐   ┌──────────────┐   │
//!   (grpc-websocket- ────┼─▶│  http   │──▶│   mux    │──▶│              │   │
//!    channel)            │  │ wrapper │   │ channel  │   │              │   │
//!                        │  │         │   │ streams  │   │  RpcHandler  │   │
//!   gRPC-web POST    ────┼─▶│         │──────────────────▶│  (services)  │   │
//!                        │  │         │   ┌──────────┐   │              │   │
//!   CORS pre-flight  ────┼─▶│         │──▶│ security │   └──────────────┘   │
//!                        │  └─────────┘   │   cors   │                      │
//!                        │                └──────────┘                      │
//!                        │  config · observability · lifecycle              │
//!                        └──────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use rpc_mux_gateway::config::{load_config, GatewayConfig};
use rpc_mux_gateway::lifecycle::signals::spawn_signal_handler;
use rpc_mux_gateway::observability::{logging, metrics};
use rpc_mux_gateway::services::EchoService;
use rpc_mux_gateway::{Gateway, HttpServer, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "rpc-mux-gateway")]
#[command(about = "Multiplexed RPC over WebSocket with gRPC-web support", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init(&config.observability.log_level);
    tracing::info!("rpc-mux-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_stream_count = config.websocket.max_stream_count,
        ping_interval_secs = config.websocket.ping_interval_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let gateway = Gateway::new(Arc::new(EchoService), config.clone())
        .with_endpoints(EchoService::lister())
        .with_shutdown(shutdown.token());
    let server = HttpServer::new(config, gateway);
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
