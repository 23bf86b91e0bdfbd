//! Stream multiplexing over a single WebSocket.
//!
//! # Data Flow
//! ```text
//! socket ─► Channel::read_loop ─► dispatch by stream id ─► StreamHandle ─► RequestBody
//!                                                                              │
//!                                                                         RpcHandler
//!                                                                              │
//! socket ◄─ writer task ◄──────────── FrameSink ◄──────────────────── StreamWriter
//! ```

pub mod channel;
pub mod stream;
pub mod writer;

pub use channel::{Channel, ChannelConfig, ChannelError, ChannelId};
pub use stream::StreamState;
pub use writer::FrameSink;
