//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes > 0, addresses parse)
//! - Validate CORS origins and header names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::HeaderName;
use thiserror::Error;

use crate::config::schema::GatewayConfig;

/// Upper bound for `cors.max_age_secs` (one day).
const MAX_CORS_AGE_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid {field} address '{value}'")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("cors.max_age_secs {0} exceeds one day")]
    MaxAgeTooLarge(u64),

    #[error("invalid header name '{0}'")]
    InvalidHeaderName(String),

    #[error("invalid origin '{0}'")]
    InvalidOrigin(String),

    #[error("unknown log level '{0}'")]
    InvalidLogLevel(String),
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }

    let ws = &config.websocket;
    for (field, value) in [
        ("websocket.read_limit_bytes", ws.read_limit_bytes),
        ("websocket.max_stream_count", ws.max_stream_count),
        ("websocket.inbound_queue_size", ws.inbound_queue_size),
        ("websocket.outbound_queue_size", ws.outbound_queue_size),
    ] {
        if value == 0 {
            errors.push(ValidationError::Zero(field));
        }
    }

    let cors = &config.cors;
    if cors.max_age_secs > MAX_CORS_AGE_SECS {
        errors.push(ValidationError::MaxAgeTooLarge(cors.max_age_secs));
    }
    for name in cors.allowed_request_headers.iter().chain(&cors.exposed_headers) {
        if name != "*" && HeaderName::from_bytes(name.as_bytes()).is_err() {
            errors.push(ValidationError::InvalidHeaderName(name.clone()));
        }
    }
    for origin in &cors.allowed_origins {
        if origin != "*" && url::Url::parse(origin).is_err() {
            errors.push(ValidationError::InvalidOrigin(origin.clone()));
        }
    }

    let obs = &config.observability;
    if !matches!(
        obs.log_level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        errors.push(ValidationError::InvalidLogLevel(obs.log_level.clone()));
    }
    if obs.metrics_enabled && obs.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: obs.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(validate_config(&GatewayConfig::default()), Ok(()));
    }

    #[test]
    fn test_all_errors_reported() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = "not an address".to_string();
        config.websocket.max_stream_count = 0;
        config.websocket.read_limit_bytes = 0;
        config.cors.allowed_request_headers = vec!["bad header".to_string()];
        config.cors.allowed_origins = vec!["*".to_string(), "nope".to_string()];
        config.cors.max_age_secs = 1_000_000;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 6);
        assert!(errors.contains(&ValidationError::Zero("websocket.max_stream_count")));
        assert!(errors.contains(&ValidationError::InvalidOrigin("nope".to_string())));
        assert!(errors.contains(&ValidationError::InvalidHeaderName("bad header".to_string())));
    }

    #[test]
    fn test_metrics_address_checked_only_when_enabled() {
        let mut config = GatewayConfig::default();
        config.observability.metrics_address = "nowhere".to_string();
        assert!(validate_config(&config).is_ok());
        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
