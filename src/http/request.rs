//! Request identification.
//!
//! Every request gets an `x-request-id` (kept if the client sent one) that
//! is attached to the request span and echoed on the response.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::Body;
use axum::http::{HeaderValue, Request};
use axum::Router;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Relaxed ordering is enough; ids only need to be unique.
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates `req-N` request ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterRequestId;

impl MakeRequestId for CounterRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        HeaderValue::from_str(&format!("req-{}", id))
            .ok()
            .map(RequestId::new)
    }
}

/// Wrap `router` with request ids and per-request tracing spans.
pub fn with_request_tracing(router: Router) -> Router {
    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::x_request_id(CounterRequestId))
}
