//! Gateway request dispatch.
//!
//! # Responsibilities
//! - Classify requests (WebSocket channel, pre-flight, gRPC-web, other)
//! - Upgrade WebSocket channel requests and run a [`Channel`] over them
//! - Answer CORS pre-flights
//! - Translate gRPC-web calls to handler invocations and back
//! - Hand everything else to the fallback router
//!
//! # Data Flow
//! ```text
//! gRPC-web POST
//!     → native form (HTTP/2, application/grpc content type, no content-length)
//!     → base64 decode (text mode)
//!     → RpcHandler::handle ─► WebResponseWriter
//!     → head (status, headers) via oneshot, body chunks via mpsc
//!     → trailer block (or trailers-only head), base64 encode (text mode)
//! ```

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{stream, FutureExt, TryStreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::config::GatewayConfig;
use crate::frame::encode_trailers;
use crate::handler::{
    BodyError, Code, EndpointLister, RequestBody, ResponseWriter, RpcHandler, RpcRequest,
    RpcStatus,
};
use crate::http::request::with_request_tracing;
use crate::http::text;
use crate::mux::{Channel, ChannelConfig};
use crate::observability::metrics;
use crate::routing::{method_path, EndpointMatcher};
use crate::security::{CorsPolicy, OriginPredicate, PreflightDecision, WebsocketOriginPredicate};

/// WebSocket subprotocol selecting the multiplexed channel.
pub const WEBSOCKET_PROTOCOL: &str = "grpc-websocket-channel";

const GRPC_WEB: &str = "application/grpc-web";
const GRPC_WEB_TEXT: &str = "application/grpc-web-text";
const GRPC: &str = "application/grpc";

/// Response body chunks buffered before handler writes wait.
const RESPONSE_QUEUE_SIZE: usize = 16;

/// What the gateway does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    WebSocketChannel,
    Preflight,
    GrpcWeb { text: bool },
    Passthrough,
}

impl RequestKind {
    pub fn classify(method: &Method, headers: &HeaderMap) -> Self {
        if is_websocket_channel(headers) {
            return Self::WebSocketChannel;
        }
        if CorsPolicy::is_preflight(method, headers) {
            return Self::Preflight;
        }
        if method == Method::POST {
            if let Some(text) = web_content_type(headers).map(|ct| ct.starts_with(GRPC_WEB_TEXT)) {
                return Self::GrpcWeb { text };
            }
        }
        Self::Passthrough
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::WebSocketChannel => "websocket",
            Self::Preflight => "preflight",
            Self::GrpcWeb { text: false } => "grpc-web",
            Self::GrpcWeb { text: true } => "grpc-web-text",
            Self::Passthrough => "passthrough",
        }
    }
}

fn is_websocket_channel(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    upgrade
        && headers
            .get_all(header::SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|p| p.trim() == WEBSOCKET_PROTOCOL)
}

/// Lowercased gRPC-web content type without parameters.
fn web_content_type(headers: &HeaderMap) -> Option<String> {
    let ct = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let ct = ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    ct.starts_with(GRPC_WEB).then_some(ct)
}

/// Rewrite `parts` into the native form the handler expects.
fn to_native(parts: &mut Parts) {
    parts.version = Version::HTTP_2;
    if let Some(ct) = web_content_type(&parts.headers) {
        let suffix = ct
            .strip_prefix(GRPC_WEB_TEXT)
            .or_else(|| ct.strip_prefix(GRPC_WEB))
            .unwrap_or_default();
        if let Ok(v) = HeaderValue::from_str(&format!("{}{}", GRPC, suffix)) {
            parts.headers.insert(header::CONTENT_TYPE, v);
        }
    }
    parts.headers.remove(header::CONTENT_LENGTH);
}

/// Map a native response content type back to the web variant.
fn to_web_content_type(native: Option<&HeaderValue>, text: bool) -> HeaderValue {
    let prefix = if text { GRPC_WEB_TEXT } else { GRPC_WEB };
    let suffix = native
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(GRPC))
        .filter(|s| !s.starts_with('-'))
        .unwrap_or("+proto");
    HeaderValue::from_str(&format!("{}{}", prefix, suffix))
        .unwrap_or_else(|_| HeaderValue::from_static(GRPC_WEB))
}

/// Builder for the gateway router.
pub struct Gateway {
    handler: Arc<dyn RpcHandler>,
    config: GatewayConfig,
    endpoints: Option<EndpointLister>,
    origin_predicate: Option<OriginPredicate>,
    websocket_origin_predicate: Option<WebsocketOriginPredicate>,
    fallback: Option<Router>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(handler: Arc<dyn RpcHandler>, config: GatewayConfig) -> Self {
        Self {
            handler,
            config,
            endpoints: None,
            origin_predicate: None,
            websocket_origin_predicate: None,
            fallback: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Endpoints the handler serves, used for restricted CORS.
    pub fn with_endpoints(mut self, endpoints: EndpointLister) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn with_origin_predicate(mut self, predicate: OriginPredicate) -> Self {
        self.origin_predicate = Some(predicate);
        self
    }

    pub fn with_websocket_origin_predicate(mut self, predicate: WebsocketOriginPredicate) -> Self {
        self.websocket_origin_predicate = Some(predicate);
        self
    }

    /// Router for requests that are not gateway traffic. Defaults to 404.
    pub fn with_fallback(mut self, router: Router) -> Self {
        self.fallback = Some(router);
        self
    }

    /// Cancelling `token` closes every open channel and in-flight call.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn into_router(self) -> Router {
        let endpoints = self
            .endpoints
            .map(|e| EndpointMatcher::new(e, self.config.routing.allow_non_root_resource));
        let mut cors = CorsPolicy::from_config(&self.config.cors, endpoints);
        if let Some(p) = self.origin_predicate {
            cors = cors.with_origin_predicate(p);
        }
        if let Some(p) = self.websocket_origin_predicate {
            cors = cors.with_websocket_origin_predicate(p);
        }

        let state = Arc::new(GatewayState {
            handler: self.handler,
            channel_config: ChannelConfig::from(&self.config),
            config: self.config,
            cors,
            fallback: self.fallback.unwrap_or_default(),
            shutdown: self.shutdown,
        });

        with_request_tracing(Router::new().fallback(dispatch).with_state(state))
    }
}

struct GatewayState {
    handler: Arc<dyn RpcHandler>,
    config: GatewayConfig,
    channel_config: ChannelConfig,
    cors: CorsPolicy,
    fallback: Router,
    shutdown: CancellationToken,
}

async fn dispatch(State(state): State<Arc<GatewayState>>, request: Request<Body>) -> Response {
    let kind = RequestKind::classify(request.method(), request.headers());
    tracing::debug!(kind = kind.label(), "Dispatching request");
    let response = match kind {
        RequestKind::WebSocketChannel if state.config.websocket.enabled => {
            upgrade_channel(&state, request).await
        }
        RequestKind::Preflight => preflight(&state, &request),
        RequestKind::GrpcWeb { text } => grpc_web(&state, request, text).await,
        _ => passthrough(&state, request).await,
    };
    metrics::record_http_request(kind.label(), response.status().as_u16());
    response
}

async fn upgrade_channel(state: &GatewayState, request: Request<Body>) -> Response {
    if !state.cors.allow_websocket_origin(request.headers()) {
        tracing::warn!(
            origin = ?request.headers().get(header::ORIGIN),
            "Rejected WebSocket origin"
        );
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let channel = Channel::with_token(
        state.handler.clone(),
        state.channel_config.clone(),
        state.shutdown.child_token(),
    );
    upgrade
        .protocols([WEBSOCKET_PROTOCOL])
        .max_message_size(state.config.websocket.read_limit_bytes)
        .on_upgrade(move |socket| async move {
            let channel_id = channel.id();
            tracing::info!(channel_id = %channel_id, "WebSocket channel opened");
            if let Err(e) = channel.serve(socket).await {
                tracing::debug!(channel_id = %channel_id, error = %e, "Channel ended with error");
            }
        })
}

fn preflight(state: &GatewayState, request: &Request<Body>) -> Response {
    let headers = request.headers();
    match state.cors.preflight_decision(request.uri().path(), headers) {
        PreflightDecision::ForbiddenOrigin => StatusCode::FORBIDDEN.into_response(),
        PreflightDecision::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        PreflightDecision::Allowed => {
            let mut response = StatusCode::NO_CONTENT.into_response();
            if let Some(origin) = state.cors.allowed_origin(headers) {
                state
                    .cors
                    .apply_preflight(origin, headers, response.headers_mut());
            }
            response
        }
    }
}

async fn passthrough(state: &GatewayState, request: Request<Body>) -> Response {
    match state.fallback.clone().oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

async fn grpc_web(state: &GatewayState, request: Request<Body>, text: bool) -> Response {
    let origin = state.cors.allowed_origin(request.headers()).cloned();
    let (mut parts, body) = request.into_parts();
    to_native(&mut parts);
    let method = method_path(parts.uri.path(), state.config.routing.allow_non_root_resource).to_string();
    tracing::debug!(operation = %method, text, "gRPC-web call");

    let chunks = body
        .into_data_stream()
        .map_err(|e| BodyError::from(text::GatewayError::from(e)));
    let body = if text {
        RequestBody::new(text::decode_body(chunks))
    } else {
        RequestBody::new(chunks)
    };
    let mut rpc = RpcRequest::new(method, parts.headers, body);
    rpc.cancel = state.shutdown.child_token();
    let cancel = rpc.cancel.clone();

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(RESPONSE_QUEUE_SIZE);
    let mut writer = WebResponseWriter::new(head_tx, body_tx, text);
    let handler = state.handler.clone();
    tokio::spawn(async move {
        let operation = rpc.method.clone();
        let status = match AssertUnwindSafe(handler.handle(rpc, &mut writer))
            .catch_unwind()
            .await
        {
            Ok(status) => status,
            Err(_) => {
                tracing::error!(operation = %operation, "Handler panicked");
                RpcStatus::new(Code::Internal, "handler panicked")
            }
        };
        tracing::debug!(operation = %operation, code = %status.code, "gRPC-web call finished");
        writer.finish(status).await;
    });

    // Dropping this future or the response body (client gone) cancels the call.
    let guard = cancel.drop_guard();
    let Ok(head) = head_rx.await else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "handler produced no response").into_response();
    };

    let body = stream::unfold((body_rx, guard), |(mut rx, guard)| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::convert::Infallible>(chunk), (rx, guard)))
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    let content_type = to_web_content_type(response.headers().get(header::CONTENT_TYPE), text);
    response.headers_mut().insert(header::CONTENT_TYPE, content_type);
    if let Some(origin) = origin {
        state.cors.apply(&origin, response.headers_mut());
    }
    response
}

struct Head {
    status: StatusCode,
    headers: HeaderMap,
}

/// Response side of a gRPC-web call.
struct WebResponseWriter {
    headers: HeaderMap,
    trailers: HeaderMap,
    head: Option<oneshot::Sender<Head>>,
    body: mpsc::Sender<Bytes>,
    encoder: Option<text::Base64Encoder>,
}

impl WebResponseWriter {
    fn new(head: oneshot::Sender<Head>, body: mpsc::Sender<Bytes>, text: bool) -> Self {
        Self {
            headers: HeaderMap::new(),
            trailers: HeaderMap::new(),
            head: Some(head),
            body,
            encoder: text.then(text::Base64Encoder::new),
        }
    }

    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
        let Some(tx) = self.head.take() else {
            return Ok(());
        };
        tx.send(Head { status, headers })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }

    async fn send_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        let chunk = match &mut self.encoder {
            Some(encoder) => encoder.push(data),
            None => Bytes::copy_from_slice(data),
        };
        self.send_raw(chunk).await
    }

    async fn send_raw(&self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.body
            .send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }

    async fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        if self.head.is_some() {
            let headers = self.headers.clone();
            self.send_head(StatusCode::OK, headers)?;
        }
        if data.is_empty() {
            return Ok(());
        }
        self.send_chunk(data).await
    }

    /// End the response with `status`.
    ///
    /// Before any output the status travels in the headers (trailers-only);
    /// afterwards a trailer block closes the body.
    async fn finish(mut self, status: RpcStatus) {
        let status = status.resolve(&self.trailers);
        if self.head.is_some() {
            let mut headers = std::mem::take(&mut self.headers);
            for (name, value) in &self.trailers {
                headers.append(name.clone(), value.clone());
            }
            headers.insert("grpc-status", HeaderValue::from(status.code.as_u32()));
            let message: String = status
                .message
                .chars()
                .filter(|c| *c != '\r' && *c != '\n')
                .collect();
            if !message.is_empty() {
                if let Ok(v) = HeaderValue::from_str(&message) {
                    headers.insert("grpc-message", v);
                }
            }
            if self.send_head(StatusCode::OK, headers).is_err() {
                tracing::debug!("Client left before trailers-only response");
            }
            return;
        }

        let block = encode_trailers(status.code.as_u32(), &status.message, &self.trailers);
        if let Err(e) = self.send_chunk(&block).await {
            tracing::debug!(error = %e, "Failed to write trailer block");
            return;
        }
        if let Some(tail) = self.encoder.as_mut().map(text::Base64Encoder::finish) {
            if let Err(e) = self.send_raw(tail).await {
                tracing::debug!(error = %e, "Failed to write final base64 group");
            }
        }
    }
}

impl ResponseWriter for WebResponseWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    fn write_headers(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let headers = self.headers.clone();
            self.send_head(status, headers)
        })
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(self.write_body(data))
    }
}
