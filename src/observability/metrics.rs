//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_channels_active` (gauge): open WebSocket channels
//! - `gateway_streams_active` (gauge): open virtual streams
//! - `gateway_streams_total` (counter): finished streams by outcome
//! - `gateway_frames_total` (counter): frames by direction and kind
//! - `gateway_http_requests_total` (counter): HTTP requests by kind and status
//!
//! Recording is a no-op until a recorder is installed with [`init_metrics`].

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

pub mod names {
    pub const CHANNELS_ACTIVE: &str = "gateway_channels_active";
    pub const STREAMS_ACTIVE: &str = "gateway_streams_active";
    pub const STREAMS_TOTAL: &str = "gateway_streams_total";
    pub const FRAMES_TOTAL: &str = "gateway_frames_total";
    pub const HTTP_REQUESTS_TOTAL: &str = "gateway_http_requests_total";
}

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_channel_opened() {
    metrics::gauge!(names::CHANNELS_ACTIVE).increment(1);
}

pub fn record_channel_closed() {
    metrics::gauge!(names::CHANNELS_ACTIVE).decrement(1);
}

pub fn record_stream_opened() {
    metrics::gauge!(names::STREAMS_ACTIVE).increment(1);
}

pub fn record_stream_closed() {
    metrics::gauge!(names::STREAMS_ACTIVE).decrement(1);
}

/// `outcome` is one of `ok`, `failed`, `cancelled`.
pub fn record_stream_outcome(outcome: &'static str) {
    metrics::counter!(names::STREAMS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_frame(direction: &'static str, kind: &'static str) {
    metrics::counter!(names::FRAMES_TOTAL, "direction" => direction, "kind" => kind).increment(1);
}

pub fn record_http_request(kind: &'static str, status: u16) {
    metrics::counter!(
        names::HTTP_REQUESTS_TOTAL,
        "kind" => kind,
        "status" => status.to_string()
    )
    .increment(1);
}
