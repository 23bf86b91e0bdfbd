//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, graceful shutdown)
//!     → request.rs (request ID, request span)
//!     → wrapper.rs (classify: WebSocket channel / pre-flight / gRPC-web / other)
//!     → text.rs (base64 body coding for grpc-web-text)
//!     → RpcHandler, or the fallback router
//! ```

pub mod request;
pub mod server;
pub mod text;
pub mod wrapper;

pub use request::X_REQUEST_ID;
pub use server::HttpServer;
pub use wrapper::{Gateway, RequestKind, WEBSOCKET_PROTOCOL};
