//! Echo service.
//!
//! - `/echo.Echo/Unary`: returns the first request message.
//! - `/echo.Echo/Stream`: returns every request message as it arrives.
//!
//! Responses are written prefix first, then payload, the way RPC runtimes
//! chunk their writes.

use std::sync::Arc;

use axum::http::HeaderValue;
use futures_util::future::BoxFuture;

use crate::frame::encode_message;
use crate::handler::{
    BodyError, Code, EndpointLister, ResponseWriter, RpcHandler, RpcRequest, RpcStatus,
};

pub const UNARY: &str = "/echo.Echo/Unary";
pub const STREAM: &str = "/echo.Echo/Stream";

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoService;

impl EchoService {
    pub fn endpoints() -> Vec<String> {
        vec![UNARY.to_string(), STREAM.to_string()]
    }

    pub fn lister() -> EndpointLister {
        Arc::new(Self::endpoints)
    }
}

impl RpcHandler for EchoService {
    fn handle<'a>(
        &'a self,
        request: RpcRequest,
        response: &'a mut dyn ResponseWriter,
    ) -> BoxFuture<'a, RpcStatus> {
        Box::pin(async move {
            match request.method.as_str() {
                UNARY => echo(request, response, true).await,
                STREAM => echo(request, response, false).await,
                other => RpcStatus::unimplemented(other),
            }
        })
    }
}

async fn echo(mut request: RpcRequest, response: &mut dyn ResponseWriter, unary: bool) -> RpcStatus {
    let mut count: usize = 0;
    loop {
        let next = tokio::select! {
            _ = request.cancel.cancelled() => return RpcStatus::cancelled(),
            next = request.body.message() => next,
        };
        let message = match next {
            Ok(Some(message)) if message.is_trailer() => continue,
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(BodyError::Cancelled) => return RpcStatus::cancelled(),
            Err(e) => return RpcStatus::new(Code::InvalidArgument, e.to_string()),
        };

        let framed = encode_message(message.flags, &message.payload);
        let (prefix, payload) = framed.split_at(crate::frame::PREFIX_LEN);
        if let Err(e) = response.write(prefix).await {
            return RpcStatus::new(Code::Unavailable, e.to_string());
        }
        if let Err(e) = response.write(payload).await {
            return RpcStatus::new(Code::Unavailable, e.to_string());
        }
        count += 1;
        if unary {
            break;
        }
    }

    if unary && count == 0 {
        return RpcStatus::new(Code::InvalidArgument, "missing request message");
    }
    if let Ok(v) = HeaderValue::from_str(&count.to_string()) {
        response.trailers_mut().insert("x-echo-count", v);
    }
    RpcStatus::ok()
}
