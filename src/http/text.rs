//! Base64 body coding for `application/grpc-web-text`.
//!
//! Request bodies arrive in arbitrary chunks and may contain padding in the
//! middle of the stream (clients encode each message separately), so decoding
//! works on whole 4-character quanta and restarts after every padded one.
//!
//! Responses are encoded as one continuous base64 text: whole 3-byte groups
//! go out as they are written and padding appears only at the very end.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use thiserror::Error;

use crate::handler::BodyError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid base64 request body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("base64 request body ended with {0} dangling characters")]
    TruncatedBase64(usize),

    #[error("request body error: {0}")]
    Body(#[from] axum::Error),
}

impl From<GatewayError> for BodyError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Body(e) => BodyError::Transport(e.to_string()),
            other => BodyError::Base64(other.to_string()),
        }
    }
}

/// Incremental base64 decoder.
#[derive(Debug, Default)]
pub struct Base64Decoder {
    pending: Vec<u8>,
}

impl Base64Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode every complete quantum buffered so far.
    pub fn push(&mut self, input: &[u8]) -> Result<Bytes, GatewayError> {
        self.pending
            .extend(input.iter().copied().filter(|b| !b.is_ascii_whitespace()));
        let complete = self.pending.len() / 4 * 4;
        let mut out = Vec::with_capacity(complete / 4 * 3);
        let mut start = 0;
        while start < complete {
            // Extend the run up to and including the next padded quantum.
            let mut end = start;
            while end < complete {
                end += 4;
                if self.pending[end - 1] == b'=' {
                    break;
                }
            }
            STANDARD.decode_vec(&self.pending[start..end], &mut out)?;
            start = end;
        }
        self.pending.drain(..complete);
        Ok(Bytes::from(out))
    }

    /// Fails if input stopped inside a quantum.
    pub fn finish(&self) -> Result<(), GatewayError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::TruncatedBase64(self.pending.len()))
        }
    }
}

/// Incremental base64 encoder.
#[derive(Debug, Default)]
pub struct Base64Encoder {
    pending: Vec<u8>,
}

impl Base64Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode every complete 3-byte group; up to two bytes wait for more.
    pub fn push(&mut self, input: &[u8]) -> Bytes {
        self.pending.extend_from_slice(input);
        let complete = self.pending.len() / 3 * 3;
        let out = STANDARD.encode(&self.pending[..complete]);
        self.pending.drain(..complete);
        Bytes::from(out)
    }

    /// Encode the held-back bytes with padding.
    pub fn finish(&mut self) -> Bytes {
        let out = STANDARD.encode(&self.pending);
        self.pending.clear();
        Bytes::from(out)
    }
}

/// Decode a text-mode request body as it streams in.
pub fn decode_body<S>(chunks: S) -> impl Stream<Item = Result<Bytes, BodyError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, BodyError>> + Send + 'static,
{
    stream::unfold(Some((chunks.boxed(), Base64Decoder::new())), |state| async move {
        let (mut chunks, mut decoder) = state?;
        loop {
            match chunks.next().await {
                Some(Ok(chunk)) => match decoder.push(&chunk) {
                    Ok(decoded) if decoded.is_empty() => continue,
                    Ok(decoded) => return Some((Ok(decoded), Some((chunks, decoder)))),
                    Err(e) => return Some((Err(e.into()), None)),
                },
                Some(Err(e)) => return Some((Err(e), None)),
                None => {
                    return match decoder.finish() {
                        Ok(()) => None,
                        Err(e) => Some((Err(e.into()), None)),
                    }
                }
            }
        }
    })
}
