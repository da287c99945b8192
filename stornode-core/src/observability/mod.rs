//! Observability infrastructure: tracing and metrics.
//!
//! Every component logs through `tracing` and records through `metrics`;
//! `init` wires both to their sinks once per process.

use crate::config::Config;
use crate::error::{Result, StorageError};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Initialize the global observability infrastructure.
///
/// `RUST_LOG` takes precedence over the configured `log_level`. The Prometheus
/// exporter is only installed when `metrics_port` is configured.
pub fn init(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| StorageError::InvalidConfig {
            reason: format!("Invalid log level '{}': {}", config.log_level, e),
        })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()
        .map_err(|e| StorageError::InvalidConfig {
            reason: format!("Tracing already initialized: {}", e),
        })?;

    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .map_err(|e| StorageError::InvalidConfig {
                reason: format!("Failed to install Prometheus exporter: {}", e),
            })?;
        tracing::info!("Prometheus metrics exported on port {}", port);
    }

    metrics::register_core_metrics();

    tracing::info!(volume_group = %config.volume_group, "Observability initialized");
    Ok(())
}
