//! Bidirectional RPC gateway multiplexing calls over WebSocket channels,
//! with gRPC-web and CORS support for browser clients.

pub mod config;
pub mod frame;
pub mod handler;
pub mod http;
pub mod lifecycle;
pub mod mux;
pub mod observability;
pub mod routing;
pub mod security;
pub mod services;

pub use config::GatewayConfig;
pub use handler::{ResponseWriter, RpcHandler, RpcRequest, RpcStatus};
pub use http::{Gateway, HttpServer};
pub use lifecycle::Shutdown;
