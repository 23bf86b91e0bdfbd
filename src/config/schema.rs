//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// WebSocket channel settings.
    pub websocket: WebSocketConfig,

    /// CORS policy for browser clients.
    pub cors: CorsConfig,

    /// Method path matching.
    pub routing: RoutingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Multiplexed WebSocket channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Accept WebSocket channel upgrades.
    pub enabled: bool,

    /// Maximum size of a single inbound WebSocket message.
    pub read_limit_bytes: usize,

    /// Keepalive ping interval in seconds (0 = disabled).
    pub ping_interval_secs: u64,

    /// Maximum concurrently open streams per channel.
    pub max_stream_count: usize,

    /// Body payloads buffered per stream before the read loop waits.
    pub inbound_queue_size: usize,

    /// Frames buffered per channel before writers wait.
    pub outbound_queue_size: usize,

    /// Answer peer pings.
    pub reply_to_ping: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_limit_bytes: 4 * 1024 * 1024,
            ping_interval_secs: 0,
            max_stream_count: 100,
            inbound_queue_size: 32,
            outbound_queue_size: 256,
            reply_to_ping: true,
        }
    }
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; "*" allows any origin. Empty denies cross-origin calls.
    pub allowed_origins: Vec<String>,

    /// Headers a pre-flight may request; "*" allows any.
    pub allowed_request_headers: Vec<String>,

    /// Extra response headers exposed to scripts.
    pub exposed_headers: Vec<String>,

    /// Pre-flight cache lifetime.
    pub max_age_secs: u64,

    /// Only answer pre-flights for served endpoints.
    pub cors_for_registered_endpoints_only: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_request_headers: vec!["*".to_string()],
            exposed_headers: Vec::new(),
            max_age_secs: 600,
            cors_for_registered_endpoints_only: true,
        }
    }
}

/// Method path matching configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RoutingConfig {
    /// Tolerate URL prefixes in front of `/package.Service/Method`.
    pub allow_non_root_resource: bool,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
