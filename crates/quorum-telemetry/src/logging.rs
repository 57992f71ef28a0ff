use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Configuration for process-wide logging.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub level: String,
    /// Per-module level overrides (e.g. "quorum_llm" => "debug").
    pub module_levels: BTreeMap<String, String>,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            module_levels: BTreeMap::new(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directive string for this config.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.level.to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_lowercase()));
        }
        filter
    }
}

/// Install the global tracing subscriber. Call once at startup.
///
/// Output goes to stderr so that stdout stays free for command output.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(config.filter_directives())
            .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?,
    };

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_info() {
        assert_eq!(LoggingConfig::default().filter_directives(), "info");
    }

    #[test]
    fn module_overrides_are_appended() {
        let mut config = LoggingConfig {
            level: "WARN".into(),
            ..Default::default()
        };
        config
            .module_levels
            .insert("quorum_telemetry".into(), "DEBUG".into());
        config.module_levels.insert("quorum_llm".into(), "trace".into());
        assert_eq!(
            config.filter_directives(),
            "warn,quorum_llm=trace,quorum_telemetry=debug"
        );
        assert!(EnvFilter::try_new(config.filter_directives()).is_ok());
    }

    #[test]
    fn config_deserializes_partially() {
        let config: LoggingConfig = serde_json::from_str(r#"{"json": true}"#).unwrap();
        assert!(config.json);
        assert_eq!(config.level, "info");
    }
}
