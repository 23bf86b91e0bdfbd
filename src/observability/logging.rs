//! Structured logging.
//!
//! `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directives for `log_level`.
pub fn default_filter(log_level: &str) -> String {
    format!("rpc_mux_gateway={},tower_http=info", log_level.to_ascii_lowercase())
}

/// Install the global subscriber. Later calls are ignored.
pub fn init(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(log_level).into());
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter("DEBUG"), "rpc_mux_gateway=debug,tower_http=info");
        assert!(default_filter("info").parse::<EnvFilter>().is_ok());
    }
}
