//! Length-prefixed RPC message framing.
//!
//! Every message is a 5-byte prefix (1 flag byte, 4-byte big-endian length)
//! followed by `length` payload bytes. The trailer block of a web response
//! reuses the same layout with the most-significant flag bit set.

use axum::http::HeaderMap;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the flag + length prefix.
pub const PREFIX_LEN: usize = 5;

/// Flag bit marking a trailer block.
pub const FLAG_TRAILER: u8 = 0x80;

/// One decoded length-prefixed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthPrefixed {
    pub flags: u8,
    pub payload: Bytes,
}

impl LengthPrefixed {
    pub fn is_trailer(&self) -> bool {
        self.flags & FLAG_TRAILER != 0
    }
}

/// Frame `payload` behind a 5-byte prefix.
pub fn encode_message(flags: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode trailing metadata as a trailer block.
///
/// `grpc-status` and `grpc-message` come first, followed by any other
/// trailers, as `name: value\r\n` lines.
pub fn encode_trailers(code: u32, message: &str, trailers: &HeaderMap) -> Bytes {
    let mut block = format!("grpc-status: {}\r\n", code);
    if !message.is_empty() {
        block.push_str("grpc-message: ");
        block.extend(message.chars().filter(|c| *c != '\r' && *c != '\n'));
        block.push_str("\r\n");
    }
    for (name, value) in trailers {
        if name == "grpc-status" || name == "grpc-message" {
            continue;
        }
        if let Ok(v) = value.to_str() {
            block.push_str(name.as_str());
            block.push_str(": ");
            block.push_str(v);
            block.push_str("\r\n");
        }
    }
    encode_message(FLAG_TRAILER, block.as_bytes())
}

/// Incremental decoder for a stream of length-prefixed messages.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message, if one is fully buffered.
    pub fn next_message(&mut self) -> Option<LengthPrefixed> {
        if self.buf.len() < PREFIX_LEN {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < PREFIX_LEN + len {
            return None;
        }
        let flags = self.buf.get_u8();
        self.buf.advance(4);
        let payload = self.buf.split_to(len).freeze();
        Some(LengthPrefixed { flags, payload })
    }

    /// Bytes of an incomplete message still waiting for more input.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// Reassembles arbitrarily-sized writes into whole framed messages.
///
/// The first bytes of each message carry its 5-byte prefix; bytes are
/// accumulated until the declared length is satisfied and the complete
/// framed message (prefix included) is handed back exactly once.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    pending: BytesMut,
    total: Option<usize>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one write; returns every message it completed, in order.
    pub fn write(&mut self, mut input: &[u8]) -> Vec<Bytes> {
        let mut complete = Vec::new();
        loop {
            if self.total.is_none() {
                if input.is_empty() {
                    break;
                }
                let take = (PREFIX_LEN - self.pending.len()).min(input.len());
                self.pending.extend_from_slice(&input[..take]);
                input = &input[take..];
                if self.pending.len() < PREFIX_LEN {
                    break;
                }
                let p = &self.pending;
                let len = u32::from_be_bytes([p[1], p[2], p[3], p[4]]) as usize;
                self.total = Some(PREFIX_LEN + len);
            }

            let total = self.total.unwrap_or(PREFIX_LEN);
            let take = (total - self.pending.len()).min(input.len());
            self.pending.extend_from_slice(&input[..take]);
            input = &input[take..];

            if self.pending.len() == total {
                complete.push(self.pending.split().freeze());
                self.total = None;
            } else {
                break;
            }
        }
        complete
    }

    /// True when a message has been started but not finished.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}
