//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the gateway router (WebSocket channels, gRPC-web, CORS)
//! - Bind server to listener
//! - Stop accepting on shutdown and cancel open channels

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::config::GatewayConfig;
use crate::http::wrapper::Gateway;

/// HTTP server for the gateway.
pub struct HttpServer {
    router: Router,
    config: GatewayConfig,
}

impl HttpServer {
    /// Create a new HTTP server serving `gateway`.
    pub fn new(config: GatewayConfig, gateway: Gateway) -> Self {
        let router = gateway.into_router();
        Self { router, config }
    }

    /// Run the server until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            websocket = self.config.websocket.enabled,
            max_streams = self.config.websocket.max_stream_count,
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
