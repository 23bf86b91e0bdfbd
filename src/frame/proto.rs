//! Protobuf envelope exchanged as one WebSocket binary message.
//!
//! Declared by hand with prost derives so no build script or `protoc` is needed.
//! Field tags are part of the wire contract with browser clients; never renumber.

use std::collections::HashMap;

#[derive(Clone, PartialEq, prost::Message)]
pub struct GrpcFrame {
    #[prost(uint32, tag = "1")]
    pub stream_id: u32,
    #[prost(oneof = "FramePayload", tags = "2, 3, 4, 5, 6, 7")]
    pub payload: Option<FramePayload>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum FramePayload {
    #[prost(message, tag = "2")]
    Ping(Ping),
    #[prost(message, tag = "3")]
    Header(Header),
    #[prost(message, tag = "4")]
    Body(Body),
    #[prost(message, tag = "5")]
    Complete(Complete),
    #[prost(message, tag = "6")]
    Failure(Failure),
    #[prost(message, tag = "7")]
    Cancel(Cancel),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Ping {
    #[prost(bool, tag = "1")]
    pub pong: bool,
}

/// Repeated values for one header name.
#[derive(Clone, PartialEq, prost::Message)]
pub struct HeaderValue {
    #[prost(string, repeated, tag = "1")]
    pub value: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub operation: String,
    #[prost(map = "string, message", tag = "2")]
    pub headers: HashMap<String, HeaderValue>,
    #[prost(int32, tag = "3")]
    pub status: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Body {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub complete: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Complete {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Failure {
    #[prost(string, tag = "1")]
    pub error_message: String,
    #[prost(string, tag = "2")]
    pub error_status: String,
    #[prost(map = "string, message", tag = "3")]
    pub headers: HashMap<String, HeaderValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Cancel {}
