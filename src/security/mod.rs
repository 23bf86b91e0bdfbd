//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → cors.rs (pre-flight decision, WebSocket origin check)
//!     → gateway dispatch
//!     → cors.rs (CORS headers on the response)
//! ```
//!
//! # Design Decisions
//! - Fail closed: disallowed origins get no CORS headers and 403 on pre-flight
//! - No trust in client input

pub mod cors;

pub use cors::{CorsPolicy, OriginPredicate, PreflightDecision, WebsocketOriginPredicate};
