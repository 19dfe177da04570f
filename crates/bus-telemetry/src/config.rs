//! Telemetry configuration from environment variables.

use crate::TelemetryError;
use serde::{Deserialize, Serialize};
use std::env;

/// Configuration for logging and metrics export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name for logs
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error)
    pub log_level: String,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Prefix of every exported Prometheus metric
    pub metrics_namespace: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "resilient-bus".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            metrics_namespace: "rb".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RB_SERVICE_NAME`: Service name (default: resilient-bus)
    /// - `RB_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `RB_JSON_LOGS`: Enable JSON logs (default: false)
    /// - `RB_METRICS_NAMESPACE`: Metric name prefix (default: rb)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            service_name: lookup("RB_SERVICE_NAME").unwrap_or(defaults.service_name),

            log_level: lookup("RB_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_level),

            json_logs: lookup("RB_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.json_logs),

            metrics_namespace: lookup("RB_METRICS_NAMESPACE")
                .unwrap_or(defaults.metrics_namespace),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.service_name.trim().is_empty() {
            return Err(TelemetryError::Config("service_name cannot be empty".into()));
        }

        let namespace_ok = self
            .metrics_namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !self
                .metrics_namespace
                .starts_with(|c: char| c.is_ascii_digit());
        if !namespace_ok {
            return Err(TelemetryError::Config(format!(
                "metrics_namespace '{}' is not a valid Prometheus prefix",
                self.metrics_namespace
            )));
        }

        Ok(())
    }
}
