//! Virtual stream: one RPC call multiplexed over a channel.
//!
//! # States
//! ```text
//! Opening ──▶ Active ──▶ InputClosed ──▶ Closed
//!    │           │             │
//!    └───────────┴─────────────┴──(Cancel)──▶ Closed
//! ```
//!
//! The channel keeps a [`StreamHandle`] (inbound side); the handler task
//! owns the [`StreamWriter`] (outbound side) and the [`RpcRequest`].

use std::io;
use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::frame::{metadata_from_headers, Frame, MessageAssembler};
use crate::handler::{BodyError, RequestBody, ResponseWriter, RpcRequest, RpcStatus};
use crate::mux::writer::FrameSink;
use crate::observability::metrics;

/// Lifecycle of a virtual stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Header seen, handler invocation scheduled.
    Opening,
    /// Handler running, data flowing both ways.
    Active,
    /// Peer finished sending; response may still be produced.
    InputClosed,
    /// Terminal.
    Closed,
}

/// State shared between the channel's handle and the handler task.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u32,
    state: Mutex<StreamState>,
    token: CancellationToken,
    abort: Mutex<Option<BodyError>>,
}

impl StreamShared {
    fn state(&self) -> StreamState {
        self.state.lock().map(|s| *s).unwrap_or(StreamState::Closed)
    }

    /// Move forward to `next`; a stream never leaves `Closed` and never
    /// goes back to an earlier state.
    fn advance(&self, next: StreamState) {
        if let Ok(mut state) = self.state.lock() {
            let rank = |s: StreamState| match s {
                StreamState::Opening => 0,
                StreamState::Active => 1,
                StreamState::InputClosed => 2,
                StreamState::Closed => 3,
            };
            if rank(next) > rank(*state) {
                tracing::trace!(stream_id = self.id, from = ?*state, to = ?next, "Stream transition");
                *state = next;
            }
        }
    }

    fn finish(&self) {
        self.advance(StreamState::Closed);
        self.token.cancel();
    }

    /// Reason the request body reports once the stream is cancelled.
    fn take_abort(&self) -> BodyError {
        self.abort
            .lock()
            .ok()
            .and_then(|mut abort| abort.take())
            .unwrap_or(BodyError::Cancelled)
    }
}

impl Drop for StreamShared {
    fn drop(&mut self) {
        metrics::record_stream_closed();
    }
}

/// Queue feeding one stream's request body.
#[derive(Debug, Clone)]
pub(crate) struct InboundSender {
    tx: mpsc::Sender<Bytes>,
}

impl InboundSender {
    /// Enqueue without waiting; the read loop never blocks on one stream.
    pub(crate) fn try_send(&self, data: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.tx.try_send(data)
    }
}

/// Channel-side view of an open stream.
#[derive(Debug)]
pub struct StreamHandle {
    shared: Arc<StreamShared>,
    inbound: Option<InboundSender>,
}

impl StreamHandle {
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub(crate) fn inbound(&self) -> Option<InboundSender> {
        self.inbound.clone()
    }

    /// Peer signalled end of request data. The output side stays open.
    pub fn close_input(&mut self) {
        if self.inbound.take().is_some() {
            self.shared.advance(StreamState::InputClosed);
        }
    }

    /// Abort the call: cancel the handler's token and go straight to Closed.
    pub fn cancel(&mut self) {
        self.inbound = None;
        self.shared.finish();
    }

    /// Peer gave up with a Failure. The handler's next body read returns
    /// [`BodyError::Aborted`], whether or not input was already closed.
    pub fn abort(&mut self, status: String, message: String) {
        if let Ok(mut abort) = self.shared.abort.lock() {
            *abort = Some(BodyError::Aborted { status, message });
        }
        self.cancel();
    }

    pub(crate) fn belongs_to(&self, writer: &StreamWriter) -> bool {
        Arc::ptr_eq(&self.shared, &writer.shared)
    }
}

/// Open a stream: returns the channel handle, the request for the handler,
/// and the writer the handler responds through.
pub fn open(
    stream_id: u32,
    method: String,
    headers: HeaderMap,
    sink: FrameSink,
    queue_size: usize,
    parent: &CancellationToken,
) -> (StreamHandle, RpcRequest, StreamWriter) {
    let token = parent.child_token();
    let shared = Arc::new(StreamShared {
        id: stream_id,
        state: Mutex::new(StreamState::Opening),
        token: token.clone(),
        abort: Mutex::new(None),
    });
    metrics::record_stream_opened();

    let (tx, rx) = mpsc::channel(queue_size.max(1));
    let body = RequestBody::new(inbound_stream(rx, shared.clone()));

    let handle = StreamHandle {
        shared: shared.clone(),
        inbound: Some(InboundSender { tx }),
    };
    let request = RpcRequest {
        method,
        headers,
        body,
        cancel: token,
    };
    let writer = StreamWriter {
        shared,
        sink,
        headers: HeaderMap::new(),
        trailers: HeaderMap::new(),
        headers_flushed: false,
        assembler: MessageAssembler::new(),
    };
    (handle, request, writer)
}

/// One Body payload per item; ends when input closes and the queue drains.
/// Cancellation wins over queued data.
fn inbound_stream(
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<StreamShared>,
) -> impl futures_util::Stream<Item = Result<Bytes, BodyError>> + Send + 'static {
    stream::unfold(Some((rx, shared)), |state| async move {
        let (mut rx, shared) = state?;
        let token = shared.token.clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => Some((Err(shared.take_abort()), None)),
            item = rx.recv() => item.map(|data| (Ok(data), Some((rx, shared)))),
        }
    })
}

/// Outbound side of a stream, driven by the handler.
pub struct StreamWriter {
    shared: Arc<StreamShared>,
    sink: FrameSink,
    headers: HeaderMap,
    trailers: HeaderMap,
    headers_flushed: bool,
    assembler: MessageAssembler,
}

impl StreamWriter {
    pub fn stream_id(&self) -> u32 {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub(crate) fn activate(&self) {
        self.shared.advance(StreamState::Active);
    }

    async fn send(&self, frame: Frame) -> io::Result<()> {
        if self.shared.state() == StreamState::Closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        self.sink
            .write(frame)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }

    async fn flush_headers(&mut self, status: StatusCode) -> io::Result<()> {
        if self.headers_flushed {
            return Ok(());
        }
        self.headers_flushed = true;
        let frame = Frame::header(
            self.shared.id,
            String::new(),
            metadata_from_headers(&self.headers),
            i32::from(status.as_u16()),
        );
        self.send(frame).await
    }

    async fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        self.flush_headers(StatusCode::OK).await?;
        for message in self.assembler.write(data) {
            self.send(Frame::body(self.shared.id, message.to_vec(), false)).await?;
        }
        Ok(())
    }

    /// Finalize the stream with the handler's status.
    ///
    /// A failed status produces one Failure frame; otherwise headers are
    /// flushed if still pending. A Complete frame always follows.
    /// Does nothing once the stream is Closed.
    pub async fn close(&mut self, status: RpcStatus) -> io::Result<()> {
        if self.shared.state() == StreamState::Closed {
            return Ok(());
        }
        let id = self.shared.id;
        let status = status.resolve(&self.trailers);
        if self.assembler.has_partial() {
            tracing::warn!(stream_id = id, "Dropping incomplete response message on close");
        }

        let result = if status.is_ok() {
            self.flush_headers(StatusCode::OK).await
        } else {
            let mut headers = metadata_from_headers(&self.headers);
            headers.extend(metadata_from_headers(&self.trailers));
            self.send(Frame::failure(
                id,
                status.code.to_string(),
                status.message.clone(),
                headers,
            ))
            .await
        };

        self.shared.finish();
        metrics::record_stream_outcome(if status.is_ok() { "ok" } else { "failed" });
        self.sink
            .write(Frame::complete(id))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        result
    }
}

impl ResponseWriter for StreamWriter {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn trailers_mut(&mut self) -> &mut HeaderMap {
        &mut self.trailers
    }

    fn write_headers(&mut self, status: StatusCode) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(self.flush_headers(status))
    }

    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(self.write_body(data))
    }
}
