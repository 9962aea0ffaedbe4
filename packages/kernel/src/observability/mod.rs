// packages/kernel/src/observability/mod.rs
//! Logging and metrics setup
//!
//! The core only emits `tracing` events and `metrics` updates; installing a
//! subscriber and a recorder is left to the binary (or embedding program).

use crate::utils::config::LoggingConfig;
use crate::utils::errors::{KernelError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.level)?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| KernelError::ObservabilityError(e.to_string()))
}

/// Install the global Prometheus recorder and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| KernelError::ObservabilityError(e.to_string()))
}

fn parse_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).map_err(|e| {
        KernelError::ObservabilityError(format!("invalid log filter '{}': {}", level, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("agent_kernel=debug,warn").is_ok());
        assert!(matches!(
            parse_filter("agent_kernel=loud"),
            Err(KernelError::ObservabilityError(_))
        ));
    }

    #[test]
    fn test_metrics_recorder_installs_once() {
        let handle = init_metrics().unwrap();
        metrics::counter!("kernel_wakeups_total", "worker" => "test").increment(1);
        assert!(handle.render().contains("kernel_wakeups_total"));
        assert!(init_metrics().is_err());
    }
}
