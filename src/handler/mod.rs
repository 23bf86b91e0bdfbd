//! Contract between the gateway and the RPC handler it fronts.
//!
//! # Data Flow
//! ```text
//! WebSocket stream / gRPC-web POST
//!     → RpcRequest (method path, headers, RequestBody, cancel token)
//!     → RpcHandler::handle
//!     → ResponseWriter (headers, body writes, trailers)
//!     → RpcStatus (trailing status)
//! ```
//!
//! # Design Decisions
//! - Handlers are trait objects so any implementation (or a test double) fits
//! - Cancellation is cooperative: handlers watch `RpcRequest::cancel`
//! - Response headers are mutable only until the first write

pub mod body;
pub mod status;

use std::io;
use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::frame::encode_message;

pub use body::{BodyError, RequestBody};
pub use status::{Code, RpcStatus};

/// Lists the method paths the handler serves (e.g. `/pkg.Service/Method`).
pub type EndpointLister = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// One call as seen by the handler.
#[derive(Debug)]
pub struct RpcRequest {
    /// Method path, `/package.Service/Method`.
    pub method: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Fires when the peer cancels or the transport goes away.
    pub cancel: CancellationToken,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, headers: HeaderMap, body: RequestBody) -> Self {
        Self {
            method: method.into(),
            headers,
            body,
            cancel: CancellationToken::new(),
        }
    }
}

/// Writable side of a call.
pub trait ResponseWriter: Send {
    /// Response headers; changes after the first flush are not transmitted.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Trailing metadata sent once the handler returns.
    fn trailers_mut(&mut self) -> &mut HeaderMap;

    /// Flush status and headers now instead of on the first write.
    fn write_headers(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>>;

    /// Write raw response bytes in the 5-byte length-prefixed format.
    /// Writes may split or join messages arbitrarily.
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;

    /// Frame `payload` as one uncompressed message and write it.
    fn write_message<'a>(&'a mut self, payload: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            let framed = encode_message(0, payload);
            self.write(&framed).await
        })
    }
}

/// Request/response processor the gateway dispatches into.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        request: RpcRequest,
        response: &'a mut dyn ResponseWriter,
    ) -> BoxFuture<'a, RpcStatus>;
}
