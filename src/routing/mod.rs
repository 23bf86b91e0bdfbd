//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! WebSocket Header frame operation / HTTP request path
//!     → method_path (strip non-root prefix when allowed)
//!     → EndpointMatcher (CORS restriction to served endpoints)
//! ```
//!
//! # Design Decisions
//! - No regex in hot path (exact matching only)
//! - Deterministic: same input always yields the same method path

pub mod matcher;

pub use matcher::{method_path, EndpointMatcher, Matcher};
