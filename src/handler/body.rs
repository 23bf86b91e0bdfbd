//! Readable request body handed to handlers.

use bytes::Bytes;
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use thiserror::Error;

use crate::frame::{LengthPrefixed, MessageDecoder};

/// Errors observed while reading a request body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BodyError {
    /// The peer terminated the call with a Failure frame.
    #[error("client aborted the call: {message} (status {status})")]
    Aborted { status: String, message: String },

    /// The call was cancelled before the body was drained.
    #[error("call cancelled")]
    Cancelled,

    /// Input ended in the middle of a length-prefixed message.
    #[error("request body ended inside a message ({0} bytes pending)")]
    Truncated(usize),

    /// Text-mode body was not valid base64.
    #[error("invalid base64 request body: {0}")]
    Base64(String),

    /// Underlying HTTP body failed.
    #[error("request body transport error: {0}")]
    Transport(String),
}

/// Request body as a sequence of raw chunks.
///
/// `chunk` yields data exactly as it arrived (one Body frame at a time on
/// the WebSocket path); `message` reassembles length-prefixed messages.
pub struct RequestBody {
    chunks: BoxStream<'static, Result<Bytes, BodyError>>,
    decoder: MessageDecoder,
}

impl RequestBody {
    pub fn new<S>(chunks: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BodyError>> + Send + 'static,
    {
        Self {
            chunks: chunks.boxed(),
            decoder: MessageDecoder::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    /// Next raw chunk, `None` once input is closed and drained.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, BodyError>> {
        self.chunks.next().await
    }

    /// Next complete length-prefixed message, `Ok(None)` at end of input.
    pub async fn message(&mut self) -> Result<Option<LengthPrefixed>, BodyError> {
        loop {
            if let Some(msg) = self.decoder.next_message() {
                return Ok(Some(msg));
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(e)) => return Err(e),
                None if self.decoder.remaining() > 0 => {
                    return Err(BodyError::Truncated(self.decoder.remaining()))
                }
                None => return Ok(None),
            }
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBody")
            .field("buffered", &self.decoder.remaining())
            .finish()
    }
}
