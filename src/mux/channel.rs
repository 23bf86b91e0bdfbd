//! Multiplexed channel: one WebSocket carrying many virtual streams.
//!
//! # Responsibilities
//! - Read binary messages one at a time and decode them into frames
//! - Dispatch frames to virtual streams by stream id
//! - Enforce the per-channel stream limit
//! - Spawn one handler task per admitted stream
//! - Emit keepalive pings when configured
//!
//! Frame dispatch is sequential; only handler invocations run concurrently.

use std::fmt::{self, Display};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{FutureExt, Sink, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::frame::{
    headers_from_metadata, Body, Failure, Frame, FrameError, Header, Payload, CONTROL_STREAM_ID,
};
use crate::handler::{Code, RpcHandler, RpcRequest, RpcStatus};
use crate::mux::stream::{self, StreamHandle, StreamWriter};
use crate::mux::writer::{spawn_writer, FrameSink};
use crate::observability::metrics;
use crate::routing::method_path;

/// Global counter for channel ids; only uniqueness matters.
static CHANNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a channel, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn new() -> Self {
        Self(CHANNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// Errors that end a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("websocket error: {0}")]
    Socket(String),

    #[error("channel closed")]
    Closed,
}

/// Per-channel settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Maximum concurrently open streams.
    pub max_stream_count: usize,
    /// Keepalive interval; `None` disables pings.
    pub ping_interval: Option<Duration>,
    /// Answer `Ping{pong: false}` with `Ping{pong: true}`.
    pub reply_to_ping: bool,
    /// Queued Body payloads per stream before the read loop waits.
    pub inbound_queue_size: usize,
    /// Queued outbound frames before writers wait.
    pub outbound_queue_size: usize,
    /// Accept operations with a URL prefix before `/pkg.Service/Method`.
    pub allow_non_root_resource: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_stream_count: 100,
            ping_interval: None,
            reply_to_ping: true,
            inbound_queue_size: 32,
            outbound_queue_size: 256,
            allow_non_root_resource: false,
        }
    }
}

impl From<&GatewayConfig> for ChannelConfig {
    fn from(config: &GatewayConfig) -> Self {
        let ws = &config.websocket;
        Self {
            max_stream_count: ws.max_stream_count,
            ping_interval: (ws.ping_interval_secs > 0)
                .then(|| Duration::from_secs(ws.ping_interval_secs)),
            reply_to_ping: ws.reply_to_ping,
            inbound_queue_size: ws.inbound_queue_size,
            outbound_queue_size: ws.outbound_queue_size,
            allow_non_root_resource: config.routing.allow_non_root_resource,
        }
    }
}

type StreamMap = Arc<DashMap<u32, StreamHandle>>;

/// One multiplexed connection bound to an RPC handler.
pub struct Channel {
    id: ChannelId,
    handler: Arc<dyn RpcHandler>,
    config: ChannelConfig,
    streams: StreamMap,
    token: CancellationToken,
    sink: FrameSink,
    outbound: Option<mpsc::Receiver<Frame>>,
}

impl Channel {
    pub fn new(handler: Arc<dyn RpcHandler>, config: ChannelConfig) -> Self {
        Self::with_token(handler, config, CancellationToken::new())
    }

    /// Create a channel whose lifetime is also bounded by `token`.
    pub fn with_token(
        handler: Arc<dyn RpcHandler>,
        config: ChannelConfig,
        token: CancellationToken,
    ) -> Self {
        let (sink, outbound) = FrameSink::channel(config.outbound_queue_size);
        Self {
            id: ChannelId::new(),
            handler,
            config,
            streams: Arc::new(DashMap::new()),
            token,
            sink,
            outbound: Some(outbound),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Token cancelled when the channel shuts down.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Queue one frame on the serialized write path.
    pub async fn write(&self, frame: Frame) -> Result<(), ChannelError> {
        self.sink.write(frame).await
    }

    /// Emit `Ping{pong: true}` every `interval` until the channel closes.
    pub fn enable_ping(&self, interval: Duration) {
        let sink = self.sink.clone();
        let token = self.token.clone();
        let channel_id = self.id;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if sink.write(Frame::ping(CONTROL_STREAM_ID, true)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::trace!(channel_id = %channel_id, "Keepalive stopped");
        });
    }

    /// Run over a combined socket until it closes.
    pub async fn serve<S, E>(self, socket: S) -> Result<(), ChannelError>
    where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
        <S as Sink<Message>>::Error: Display,
        E: Display,
    {
        let (writer, reader) = socket.split();
        self.start(reader, writer).await
    }

    /// Read and dispatch frames until the socket closes or a transport
    /// error occurs, then close every stream and the channel itself.
    pub async fn start<R, W, E>(mut self, reader: R, writer: W) -> Result<(), ChannelError>
    where
        R: Stream<Item = Result<Message, E>> + Send,
        W: Sink<Message> + Send + 'static,
        W::Error: Display,
        E: Display,
    {
        let outbound = self.outbound.take().ok_or(ChannelError::Closed)?;
        let writer_task = spawn_writer(writer, outbound, self.token.clone());
        if let Some(interval) = self.config.ping_interval {
            self.enable_ping(interval);
        }

        metrics::record_channel_opened();
        tracing::debug!(channel_id = %self.id, "Channel started");

        let result = self.read_loop(reader).await;
        match &result {
            Ok(()) => tracing::debug!(channel_id = %self.id, "Channel closed by peer"),
            Err(e) => tracing::warn!(channel_id = %self.id, error = %e, "Channel failed"),
        }

        self.close();
        if let Err(e) = writer_task.await {
            tracing::error!(channel_id = %self.id, error = %e, "Writer task panicked");
        }
        metrics::record_channel_closed();
        result
    }

    async fn read_loop<R, E>(&self, reader: R) -> Result<(), ChannelError>
    where
        R: Stream<Item = Result<Message, E>>,
        E: Display,
    {
        let mut reader = Box::pin(reader);
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                next = reader.next() => next,
            };
            let data = match next {
                None => return Ok(()),
                Some(Err(e)) => return Err(ChannelError::Socket(e.to_string())),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) => return Ok(()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    return Err(FrameError::UnexpectedMessageType("text").into())
                }
            };
            let frame = Frame::decode(&data)?;
            metrics::record_frame("in", frame.payload.kind());
            tracing::trace!(
                channel_id = %self.id,
                stream_id = frame.stream_id,
                kind = frame.payload.kind(),
                "Frame received"
            );
            self.dispatch(frame).await;
        }
    }

    async fn dispatch(&self, frame: Frame) {
        let id = frame.stream_id;
        match frame.payload {
            Payload::Header(header) => self.on_header(id, header).await,
            Payload::Body(body) => self.on_body(id, body).await,
            Payload::Cancel => self.on_cancel(id),
            Payload::Complete => self.on_complete(id).await,
            Payload::Failure(failure) => self.on_failure(id, failure),
            Payload::Ping { pong } => self.on_ping(id, pong).await,
        }
    }

    async fn on_header(&self, id: u32, header: Header) {
        if id == CONTROL_STREAM_ID {
            return self.reply_failure(id, Code::InvalidArgument, "stream id 0 is reserved").await;
        }
        if self.streams.contains_key(&id) {
            return self.reply_failure(id, Code::AlreadyExists, "stream already exists").await;
        }
        // Reject once the limit is reached, so at most `max_stream_count` run.
        if self.streams.len() >= self.config.max_stream_count {
            tracing::warn!(
                channel_id = %self.id,
                stream_id = id,
                max = self.config.max_stream_count,
                "Stream limit reached"
            );
            return self.reply_failure(id, Code::ResourceExhausted, "max streams reached").await;
        }

        let method = method_path(&header.operation, self.config.allow_non_root_resource).to_string();
        tracing::debug!(channel_id = %self.id, stream_id = id, operation = %method, "Opening stream");

        let (handle, request, writer) = stream::open(
            id,
            method,
            headers_from_metadata(&header.headers),
            self.sink.clone(),
            self.config.inbound_queue_size,
            &self.token,
        );
        self.streams.insert(id, handle);

        let handler = self.handler.clone();
        let streams = self.streams.clone();
        tokio::spawn(async move {
            let method = request.method.clone();
            let status = run_handler(handler.as_ref(), request, writer, &streams).await;
            tracing::debug!(
                stream_id = id,
                operation = %method,
                code = %status.code,
                "Stream finished"
            );
        });
    }

    async fn on_body(&self, id: u32, body: Body) {
        let inbound = self.streams.get(&id).map(|h| h.inbound());
        let Some(inbound) = inbound else {
            return self.reply_failure(id, Code::NotFound, "stream does not exist").await;
        };
        let Some(sender) = inbound else {
            tracing::debug!(stream_id = id, "Ignoring body after input closed");
            return;
        };
        if !body.data.is_empty() {
            match sender.try_send(Bytes::from(body.data)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => return self.overflow(id).await,
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(stream_id = id, "Dropping body for finished stream");
                }
            }
        }
        if body.complete {
            if let Some(mut handle) = self.streams.get_mut(&id) {
                handle.close_input();
            }
        }
    }

    /// The handler is not draining its input. End that stream alone.
    async fn overflow(&self, id: u32) {
        let Some((_, mut handle)) = self.streams.remove(&id) else {
            return;
        };
        tracing::warn!(
            channel_id = %self.id,
            stream_id = id,
            capacity = self.config.inbound_queue_size,
            "Inbound queue full, failing stream"
        );
        metrics::record_stream_outcome("failed");
        handle.cancel();
        self.reply_failure(id, Code::ResourceExhausted, "inbound queue full").await;
        if let Err(e) = self.sink.write(Frame::complete(id)).await {
            tracing::debug!(error = %e, "Failed to send complete");
        }
    }

    fn on_cancel(&self, id: u32) {
        match self.streams.remove(&id) {
            Some((_, mut handle)) => {
                tracing::debug!(stream_id = id, "Stream cancelled by peer");
                metrics::record_stream_outcome("cancelled");
                handle.cancel();
            }
            // Cancel racing with completion is expected.
            None => tracing::trace!(stream_id = id, "Cancel for unknown stream"),
        }
    }

    async fn on_complete(&self, id: u32) {
        let found = match self.streams.get_mut(&id) {
            Some(mut handle) => {
                handle.close_input();
                true
            }
            None => false,
        };
        if !found {
            self.reply_failure(id, Code::NotFound, "stream does not exist").await;
        }
    }

    fn on_failure(&self, id: u32, failure: Failure) {
        let Some((_, mut handle)) = self.streams.remove(&id) else {
            tracing::trace!(stream_id = id, "Failure for unknown stream");
            return;
        };
        tracing::debug!(
            stream_id = id,
            status = %failure.error_status,
            message = %failure.error_message,
            "Stream aborted by peer"
        );
        metrics::record_stream_outcome("cancelled");
        handle.abort(failure.error_status, failure.error_message);
    }

    async fn on_ping(&self, id: u32, pong: bool) {
        if !pong && self.config.reply_to_ping {
            if let Err(e) = self.sink.write(Frame::ping(id, true)).await {
                tracing::debug!(error = %e, "Failed to answer ping");
            }
        }
    }

    async fn reply_failure(&self, id: u32, code: Code, message: &str) {
        tracing::debug!(channel_id = %self.id, stream_id = id, code = %code, message, "Rejecting frame");
        let frame = Frame::failure(id, code.to_string(), message, Default::default());
        if let Err(e) = self.sink.write(frame).await {
            tracing::debug!(error = %e, "Failed to send failure");
        }
    }

    /// Cancel every stream and the channel token.
    fn close(&self) {
        self.token.cancel();
        self.streams.retain(|_, handle| {
            metrics::record_stream_outcome("cancelled");
            handle.cancel();
            false
        });
    }
}

/// Drive one handler invocation and finalize its stream.
async fn run_handler(
    handler: &dyn RpcHandler,
    request: RpcRequest,
    mut writer: StreamWriter,
    streams: &StreamMap,
) -> RpcStatus {
    writer.activate();
    let id = writer.stream_id();
    let status = match AssertUnwindSafe(handler.handle(request, &mut writer))
        .catch_unwind()
        .await
    {
        Ok(status) => status,
        Err(_) => {
            tracing::error!(stream_id = id, "Handler panicked");
            RpcStatus::new(Code::Internal, "handler panicked")
        }
    };
    // Leave the active set before Complete goes out so the id is reusable
    // as soon as the peer sees it.
    streams.remove_if(&id, |_, handle| handle.belongs_to(&writer));
    if let Err(e) = writer.close(status.clone()).await {
        tracing::debug!(stream_id = id, error = %e, "Failed to finalize stream");
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use futures_util::future::BoxFuture;
    use futures_util::{sink, stream as fstream};
    use tokio::sync::{mpsc::UnboundedReceiver, mpsc::UnboundedSender, oneshot, Mutex};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use crate::frame::{encode_message, Metadata};
    use crate::handler::{BodyError, ResponseWriter};
    use crate::services::echo::{EchoService, STREAM, UNARY};

    struct Peer {
        tx: UnboundedSender<Message>,
        rx: UnboundedReceiver<Message>,
        task: JoinHandle<Result<(), ChannelError>>,
    }

    fn connect(handler: Arc<dyn RpcHandler>, config: ChannelConfig) -> Peer {
        let (client_tx, server_rx) = mpsc::unbounded_channel::<Message>();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<Message>();
        let reader = fstream::unfold(server_rx, |mut rx| async move {
            rx.recv().await.map(|m| (Ok::<_, Infallible>(m), rx))
        });
        let writer = sink::unfold(server_tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(|_| "peer gone")?;
            Ok::<_, &str>(tx)
        });
        let channel = Channel::new(handler, config);
        Peer {
            tx: client_tx,
            rx: client_rx,
            task: tokio::spawn(channel.start(reader, writer)),
        }
    }

    fn echo() -> Peer {
        connect(Arc::new(EchoService), ChannelConfig::default())
    }

    impl Peer {
        fn send(&self, frame: Frame) {
            self.tx.send(Message::Binary(frame.encode())).unwrap();
        }

        fn open(&self, id: u32, operation: &str) {
            self.send(Frame::header(id, operation, Metadata::new(), 0));
        }

        async fn recv(&mut self) -> Frame {
            let msg = timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel closed");
            match msg {
                Message::Binary(data) => Frame::decode(&data).unwrap(),
                other => panic!("unexpected message {:?}", other),
            }
        }

        async fn assert_silent(&mut self) {
            assert!(timeout(Duration::from_millis(100), self.rx.recv()).await.is_err());
        }
    }

    fn failure(id: u32, code: Code, message: &str) -> Frame {
        Frame::failure(id, code.to_string(), message, Metadata::new())
    }

    /// Waits for cancellation and reports it.
    struct WaitForCancel {
        observed: Mutex<Option<oneshot::Sender<()>>>,
    }

    impl RpcHandler for WaitForCancel {
        fn handle<'a>(
            &'a self,
            request: RpcRequest,
            _response: &'a mut dyn ResponseWriter,
        ) -> BoxFuture<'a, RpcStatus> {
            Box::pin(async move {
                request.cancel.cancelled().await;
                if let Some(tx) = self.observed.lock().await.take() {
                    let _ = tx.send(());
                }
                RpcStatus::cancelled()
            })
        }
    }

    fn wait_for_cancel() -> (Arc<WaitForCancel>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(WaitForCancel {
                observed: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Reports how its request body ended.
    struct ReportsBody {
        observed: Mutex<Option<oneshot::Sender<Option<BodyError>>>>,
    }

    impl RpcHandler for ReportsBody {
        fn handle<'a>(
            &'a self,
            mut request: RpcRequest,
            _response: &'a mut dyn ResponseWriter,
        ) -> BoxFuture<'a, RpcStatus> {
            Box::pin(async move {
                let outcome = loop {
                    match request.body.chunk().await {
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Some(e),
                        None => break None,
                    }
                };
                if let Some(tx) = self.observed.lock().await.take() {
                    let _ = tx.send(outcome);
                }
                RpcStatus::ok()
            })
        }
    }

    /// Streams responses until its writes fail, then reports whether the
    /// call was cancelled.
    struct Ticker {
        observed: Mutex<Option<oneshot::Sender<bool>>>,
    }

    impl RpcHandler for Ticker {
        fn handle<'a>(
            &'a self,
            mut request: RpcRequest,
            response: &'a mut dyn ResponseWriter,
        ) -> BoxFuture<'a, RpcStatus> {
            Box::pin(async move {
                while let Some(Ok(_)) = request.body.chunk().await {}
                loop {
                    if response.write_message(b"tick").await.is_err() {
                        break;
                    }
                    tokio::select! {
                        _ = request.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                    }
                }
                if let Some(tx) = self.observed.lock().await.take() {
                    let _ = tx.send(request.cancel.is_cancelled());
                }
                RpcStatus::ok()
            })
        }
    }

    /// Never reads its body on `/svc.Slow/Call`; echoes everything else.
    struct IgnoresBody {
        slow: Arc<WaitForCancel>,
        echo: EchoService,
    }

    impl RpcHandler for IgnoresBody {
        fn handle<'a>(
            &'a self,
            request: RpcRequest,
            response: &'a mut dyn ResponseWriter,
        ) -> BoxFuture<'a, RpcStatus> {
            if request.method == "/svc.Slow/Call" {
                self.slow.handle(request, response)
            } else {
                self.echo.handle(request, response)
            }
        }
    }

    struct Failing;

    impl RpcHandler for Failing {
        fn handle<'a>(
            &'a self,
            _request: RpcRequest,
            _response: &'a mut dyn ResponseWriter,
        ) -> BoxFuture<'a, RpcStatus> {
            Box::pin(async { RpcStatus::new(Code::NotFound, "no such citizen") })
        }
    }

    #[tokio::test]
    async fn test_unary_call_end_to_end() {
        let mut peer = echo();
        let framed = encode_message(0, b"hi");
        peer.open(7, UNARY);
        peer.send(Frame::body(7, framed.to_vec(), true));

        assert_eq!(peer.recv().await, Frame::header(7, "", Metadata::new(), 200));
        assert_eq!(peer.recv().await, Frame::body(7, framed.to_vec(), false));
        assert_eq!(peer.recv().await, Frame::complete(7));
    }

    #[tokio::test]
    async fn test_body_frames_read_in_order() {
        let mut peer = echo();
        peer.open(1, STREAM);
        for payload in [&b"a"[..], b"b", b"c"] {
            peer.send(Frame::body(1, encode_message(0, payload).to_vec(), false));
        }
        peer.send(Frame::complete(1));

        assert!(matches!(peer.recv().await.payload, Payload::Header(_)));
        for payload in [&b"a"[..], b"b", b"c"] {
            assert_eq!(peer.recv().await, Frame::body(1, encode_message(0, payload).to_vec(), false));
        }
        assert_eq!(peer.recv().await, Frame::complete(1));
    }

    #[tokio::test]
    async fn test_admission_rejects_at_limit() {
        let config = ChannelConfig {
            max_stream_count: 2,
            ..ChannelConfig::default()
        };
        let mut peer = connect(Arc::new(EchoService), config);
        peer.open(1, STREAM);
        peer.open(2, STREAM);
        peer.open(3, STREAM);
        assert_eq!(peer.recv().await, failure(3, Code::ResourceExhausted, "max streams reached"));

        // Admitted streams keep working, and a finished one frees its slot.
        peer.send(Frame::body(1, encode_message(0, b"x").to_vec(), true));
        assert!(matches!(peer.recv().await.payload, Payload::Header(_)));
        assert!(matches!(peer.recv().await.payload, Payload::Body(_)));
        assert_eq!(peer.recv().await, Frame::complete(1));

        peer.open(4, UNARY);
        peer.send(Frame::body(4, encode_message(0, b"y").to_vec(), true));
        assert_eq!(peer.recv().await, Frame::header(4, "", Metadata::new(), 200));
    }

    #[tokio::test]
    async fn test_duplicate_header_rejected() {
        let mut peer = echo();
        peer.open(5, STREAM);
        peer.open(5, STREAM);
        assert_eq!(peer.recv().await, failure(5, Code::AlreadyExists, "stream already exists"));
    }

    #[tokio::test]
    async fn test_frames_for_unknown_stream() {
        let mut peer = echo();
        peer.send(Frame::body(42, b"data".to_vec(), false));
        assert_eq!(peer.recv().await, failure(42, Code::NotFound, "stream does not exist"));
        peer.send(Frame::complete(43));
        assert_eq!(peer.recv().await, failure(43, Code::NotFound, "stream does not exist"));
        peer.send(Frame::cancel(44));
        peer.assert_silent().await;
    }

    #[tokio::test]
    async fn test_reserved_stream_id() {
        let mut peer = echo();
        peer.open(0, UNARY);
        assert_eq!(peer.recv().await, failure(0, Code::InvalidArgument, "stream id 0 is reserved"));
    }

    #[tokio::test]
    async fn test_cancel_reaches_handler_and_removes_stream() {
        let (handler, observed) = wait_for_cancel();
        let mut peer = connect(handler, ChannelConfig::default());
        peer.open(11, "/svc.Slow/Call");
        peer.send(Frame::cancel(11));

        timeout(Duration::from_secs(2), observed).await.unwrap().unwrap();
        peer.send(Frame::body(11, b"late".to_vec(), false));
        assert_eq!(peer.recv().await, failure(11, Code::NotFound, "stream does not exist"));
    }

    #[tokio::test]
    async fn test_peer_failure_aborts_request_body() {
        let (tx, observed) = oneshot::channel();
        let handler = Arc::new(ReportsBody {
            observed: Mutex::new(Some(tx)),
        });
        let mut peer = connect(handler, ChannelConfig::default());
        peer.open(13, "/svc.Upload/Send");
        peer.send(Frame::body(13, encode_message(0, b"part").to_vec(), false));
        peer.send(Frame::failure(13, "1", "user navigated away", Metadata::new()));

        let outcome = timeout(Duration::from_secs(2), observed).await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Some(BodyError::Aborted {
                status: "1".into(),
                message: "user navigated away".into(),
            })
        );
        peer.assert_silent().await;
        peer.send(Frame::body(13, b"late".to_vec(), false));
        assert_eq!(peer.recv().await, failure(13, Code::NotFound, "stream does not exist"));
    }

    #[tokio::test]
    async fn test_peer_failure_after_input_closed_stops_handler() {
        let (tx, observed) = oneshot::channel();
        let handler = Arc::new(Ticker {
            observed: Mutex::new(Some(tx)),
        });
        let mut peer = connect(handler, ChannelConfig::default());
        peer.open(9, "/svc.Feed/Watch");
        peer.send(Frame::body(9, encode_message(0, b"sub").to_vec(), true));
        assert!(matches!(peer.recv().await.payload, Payload::Header(_)));
        assert!(matches!(peer.recv().await.payload, Payload::Body(_)));

        peer.send(Frame::failure(9, "1", "unsubscribed", Metadata::new()));
        let cancelled = timeout(Duration::from_secs(2), observed).await.unwrap().unwrap();
        assert!(cancelled);

        // Ticks already queued may still arrive; then the stream goes quiet.
        let mut drained = 0;
        while let Ok(Some(_)) = timeout(Duration::from_millis(100), peer.rx.recv()).await {
            drained += 1;
            assert!(drained < 50, "handler kept streaming after abort");
        }
        peer.send(Frame::body(9, b"late".to_vec(), false));
        assert_eq!(peer.recv().await, failure(9, Code::NotFound, "stream does not exist"));
    }

    #[tokio::test]
    async fn test_full_inbound_queue_fails_only_that_stream() {
        let (slow, observed) = wait_for_cancel();
        let handler = Arc::new(IgnoresBody {
            slow,
            echo: EchoService,
        });
        let config = ChannelConfig {
            inbound_queue_size: 2,
            ..ChannelConfig::default()
        };
        let mut peer = connect(handler, config);
        peer.open(1, "/svc.Slow/Call");
        for _ in 0..5 {
            peer.send(Frame::body(1, encode_message(0, b"chunk").to_vec(), false));
        }
        peer.send(Frame::cancel(1));
        peer.open(2, UNARY);
        peer.send(Frame::body(2, encode_message(0, b"hi").to_vec(), true));

        assert_eq!(peer.recv().await, failure(1, Code::ResourceExhausted, "inbound queue full"));
        assert_eq!(peer.recv().await, Frame::complete(1));
        assert_eq!(peer.recv().await, failure(1, Code::NotFound, "stream does not exist"));
        assert_eq!(peer.recv().await, failure(1, Code::NotFound, "stream does not exist"));
        timeout(Duration::from_secs(2), observed).await.unwrap().unwrap();

        assert_eq!(peer.recv().await, Frame::header(2, "", Metadata::new(), 200));
        assert_eq!(peer.recv().await, Frame::body(2, encode_message(0, b"hi").to_vec(), false));
        assert_eq!(peer.recv().await, Frame::complete(2));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure() {
        let mut peer = connect(Arc::new(Failing), ChannelConfig::default());
        peer.open(3, "/citizens.Citizens/Get");
        assert_eq!(peer.recv().await, failure(3, Code::NotFound, "no such citizen"));
        assert_eq!(peer.recv().await, Frame::complete(3));
        peer.assert_silent().await;
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let mut peer = echo();
        peer.send(Frame::ping(0, false));
        assert_eq!(peer.recv().await, Frame::ping(0, true));
        peer.send(Frame::ping(0, true));
        peer.assert_silent().await;
    }

    #[tokio::test]
    async fn test_keepalive_pings() {
        let config = ChannelConfig {
            ping_interval: Some(Duration::from_millis(20)),
            ..ChannelConfig::default()
        };
        let mut peer = connect(Arc::new(EchoService), config);
        assert_eq!(peer.recv().await, Frame::ping(0, true));
        assert_eq!(peer.recv().await, Frame::ping(0, true));
    }

    #[tokio::test]
    async fn test_text_message_is_fatal() {
        let peer = echo();
        peer.tx.send(Message::Text("hello".into())).unwrap();
        let result = timeout(Duration::from_secs(2), peer.task).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(ChannelError::Frame(FrameError::UnexpectedMessageType(_)))
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_fatal() {
        let peer = echo();
        peer.tx.send(Message::Binary(Bytes::from_static(&[0x0a, 0xff]))).unwrap();
        let result = timeout(Duration::from_secs(2), peer.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(ChannelError::Frame(FrameError::Decode(_)))));
    }

    #[tokio::test]
    async fn test_socket_close_cancels_streams() {
        let (handler, observed) = wait_for_cancel();
        let peer = connect(handler, ChannelConfig::default());
        peer.open(21, "/svc.Slow/Call");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let Peer { tx, task, .. } = peer;
        drop(tx);

        timeout(Duration::from_secs(2), observed).await.unwrap().unwrap();
        assert!(timeout(Duration::from_secs(2), task).await.unwrap().unwrap().is_ok());
    }
}
