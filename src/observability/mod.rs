//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Channels, streams and the HTTP gateway produce:
//!     → logging.rs (structured events with channel_id / stream_id / operation)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout (tracing-subscriber fmt layer)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through every HTTP request via tower-http
//! - Metrics are cheap (atomic increments) and no-ops without a recorder

pub mod logging;
pub mod metrics;
