//! Frame envelope and its binary encoding.

use std::collections::HashMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use prost::Message as _;
use thiserror::Error;

use crate::frame::proto;

/// Header multimap carried inside `Header` and `Failure` frames.
pub type Metadata = HashMap<String, Vec<String>>;

/// Stream id reserved for channel-level control traffic.
pub const CONTROL_STREAM_ID: u32 = 0;

/// Errors raised while turning WebSocket messages into frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Truncated or otherwise invalid protobuf envelope.
    #[error("malformed frame: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Envelope decoded but the payload oneof was empty.
    #[error("frame for stream {0} carries no payload")]
    MissingPayload(u32),

    /// Text (or other non-binary) WebSocket message.
    #[error("unexpected {0} websocket message, only binary frames are accepted")]
    UnexpectedMessageType(&'static str),
}

/// One discrete unit exchanged over a multiplexed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: u32,
    pub payload: Payload,
}

/// Exactly one of the six payload kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ping { pong: bool },
    Header(Header),
    Body(Body),
    Complete,
    Failure(Failure),
    Cancel,
}

/// Opens a call (client to server) or starts a response (server to client).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub operation: String,
    pub headers: Metadata,
    pub status: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Body {
    pub data: Vec<u8>,
    pub complete: bool,
}

/// Terminal error for a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Failure {
    pub error_message: String,
    pub error_status: String,
    pub headers: Metadata,
}

impl Payload {
    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Ping { .. } => "ping",
            Payload::Header(_) => "header",
            Payload::Body(_) => "body",
            Payload::Complete => "complete",
            Payload::Failure(_) => "failure",
            Payload::Cancel => "cancel",
        }
    }
}

impl Frame {
    pub fn ping(stream_id: u32, pong: bool) -> Self {
        Self { stream_id, payload: Payload::Ping { pong } }
    }

    pub fn header(stream_id: u32, operation: impl Into<String>, headers: Metadata, status: i32) -> Self {
        Self {
            stream_id,
            payload: Payload::Header(Header {
                operation: operation.into(),
                headers,
                status,
            }),
        }
    }

    pub fn body(stream_id: u32, data: impl Into<Vec<u8>>, complete: bool) -> Self {
        Self {
            stream_id,
            payload: Payload::Body(Body {
                data: data.into(),
                complete,
            }),
        }
    }

    pub fn complete(stream_id: u32) -> Self {
        Self { stream_id, payload: Payload::Complete }
    }

    pub fn failure(
        stream_id: u32,
        error_status: impl Into<String>,
        error_message: impl Into<String>,
        headers: Metadata,
    ) -> Self {
        Self {
            stream_id,
            payload: Payload::Failure(Failure {
                error_message: error_message.into(),
                error_status: error_status.into(),
                headers,
            }),
        }
    }

    pub fn cancel(stream_id: u32) -> Self {
        Self { stream_id, payload: Payload::Cancel }
    }

    /// Serialize into the bytes of one binary WebSocket message.
    pub fn encode(&self) -> Bytes {
        Bytes::from(proto::GrpcFrame::from(self).encode_to_vec())
    }

    /// Parse one binary WebSocket message.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let wire = proto::GrpcFrame::decode(buf)?;
        let stream_id = wire.stream_id;
        let payload = match wire.payload.ok_or(FrameError::MissingPayload(stream_id))? {
            proto::FramePayload::Ping(p) => Payload::Ping { pong: p.pong },
            proto::FramePayload::Header(h) => Payload::Header(Header {
                operation: h.operation,
                headers: metadata_from_wire(h.headers),
                status: h.status,
            }),
            proto::FramePayload::Body(b) => Payload::Body(Body {
                data: b.data,
                complete: b.complete,
            }),
            proto::FramePayload::Complete(_) => Payload::Complete,
            proto::FramePayload::Failure(f) => Payload::Failure(Failure {
                error_message: f.error_message,
                error_status: f.error_status,
                headers: metadata_from_wire(f.headers),
            }),
            proto::FramePayload::Cancel(_) => Payload::Cancel,
        };
        Ok(Self { stream_id, payload })
    }
}

impl From<&Frame> for proto::GrpcFrame {
    fn from(frame: &Frame) -> Self {
        let payload = match &frame.payload {
            Payload::Ping { pong } => proto::FramePayload::Ping(proto::Ping { pong: *pong }),
            Payload::Header(h) => proto::FramePayload::Header(proto::Header {
                operation: h.operation.clone(),
                headers: metadata_to_wire(&h.headers),
                status: h.status,
            }),
            Payload::Body(b) => proto::FramePayload::Body(proto::Body {
                data: b.data.clone(),
                complete: b.complete,
            }),
            Payload::Complete => proto::FramePayload::Complete(proto::Complete {}),
            Payload::Failure(f) => proto::FramePayload::Failure(proto::Failure {
                error_message: f.error_message.clone(),
                error_status: f.error_status.clone(),
                headers: metadata_to_wire(&f.headers),
            }),
            Payload::Cancel => proto::FramePayload::Cancel(proto::Cancel {}),
        };
        proto::GrpcFrame {
            stream_id: frame.stream_id,
            payload: Some(payload),
        }
    }
}

fn metadata_to_wire(md: &Metadata) -> HashMap<String, proto::HeaderValue> {
    md.iter()
        .map(|(k, v)| (k.clone(), proto::HeaderValue { value: v.clone() }))
        .collect()
}

fn metadata_from_wire(wire: HashMap<String, proto::HeaderValue>) -> Metadata {
    wire.into_iter().map(|(k, v)| (k, v.value)).collect()
}

/// Collect a header map into the frame multimap. Non-UTF-8 values are dropped.
pub fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    let mut md = Metadata::new();
    for (name, value) in headers {
        match value.to_str() {
            Ok(v) => md.entry(name.as_str().to_string()).or_default().push(v.to_string()),
            Err(_) => tracing::debug!(header = %name, "Dropping non-text header value"),
        }
    }
    md
}

/// Build a header map from the frame multimap, lower-casing names.
pub fn headers_from_metadata(md: &Metadata) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in md {
        let Ok(name) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) else {
            tracing::debug!(header = %name, "Skipping invalid header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    headers.append(name.clone(), v);
                }
                Err(_) => tracing::debug!(header = %name, "Skipping invalid header value"),
            }
        }
    }
    headers
}
