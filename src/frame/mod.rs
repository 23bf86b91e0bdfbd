//! Wire formats shared by both transports.
//!
//! # Data Flow
//! ```text
//! WebSocket binary message
//!     → codec.rs (protobuf envelope ⇄ Frame)
//!     → Body frames carry length-prefixed RPC messages
//!     → message.rs (5-byte prefix framing, trailer blocks, reassembly)
//! ```
//!
//! # Design Decisions
//! - `Payload` is a closed enum so dispatch is checked for exhaustiveness
//! - Protobuf schema declared with prost derives (no codegen step)
//! - One Body frame always carries whole framed messages on the way out

pub mod codec;
pub mod message;
mod proto;

pub use codec::{
    headers_from_metadata, metadata_from_headers, Body, Failure, Frame, FrameError, Header,
    Metadata, Payload, CONTROL_STREAM_ID,
};
pub use message::{
    encode_message, encode_trailers, LengthPrefixed, MessageAssembler, MessageDecoder,
    FLAG_TRAILER, PREFIX_LEN,
};
