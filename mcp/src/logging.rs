//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; embedding processes call
//! [`init_logging`] once to install a subscriber.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            ansi: default_ansi(),
        }
    }
}

impl LoggingConfig {
    fn env_filter(&self) -> GatewayResult<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level).map_err(|e| {
                GatewayError::Config(format!("invalid log level '{}': {}", self.level, e))
            }),
        }
    }
}

/// Install the global subscriber. Fails instead of panicking when one is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> GatewayResult<()> {
    let filter = config.env_filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_ansi(config.ansi))
            .try_init()
    };

    result.map_err(|e| GatewayError::Config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_defaults() {
        let config: LoggingConfig = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(config.level, "info");
        assert!(!config.json);
        assert!(config.ansi);
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_level_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "toolgate=notalevel".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_second_init_is_an_error() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            ansi: false,
            ..LoggingConfig::default()
        };
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
