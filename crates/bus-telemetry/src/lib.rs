//! # Bus Telemetry
//!
//! Observability for [`resilient_bus`]:
//!
//! - **Logging**: installs a `tracing-subscriber` registry with an
//!   `EnvFilter` and either JSON or human-readable output.
//! - **Metrics**: exports bus counters and circuit state through an owned
//!   Prometheus registry.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_telemetry::{init_logging, BusMetricsExporter, TelemetryConfig};
//!
//! let config = TelemetryConfig::from_env();
//! init_logging(&config)?;
//!
//! let exporter = BusMetricsExporter::new(&config.metrics_namespace)?;
//! exporter.observe(&bus.metrics());
//! exporter.observe_circuit(bus.circuit_state());
//! let body = exporter.encode()?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RB_SERVICE_NAME` | `resilient-bus` | Service name attached to startup logs |
//! | `RB_LOG_LEVEL` or `RUST_LOG` | `info` | Log level filter |
//! | `RB_JSON_LOGS` | `false` | Emit JSON formatted logs |
//! | `RB_METRICS_NAMESPACE` | `rb` | Prefix of exported metric names |

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::init_logging;
pub use metrics::BusMetricsExporter;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}
