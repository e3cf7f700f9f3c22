//! Self-monitoring: logging and metrics of the service itself

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{LoggingConfig, MetricsConfig};
use crate::error::{Error, Result};

/// Install the global logger.
///
/// `RUST_LOG` wins over `config.level`; `verbose` forces `debug`. Logs go to
/// stderr through a background writer, so keep the returned guard alive
/// until exit or buffered lines are lost.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<WorkerGuard> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::config(format!("invalid log level '{level}': {e}")))?;

    // stdout carries command output
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "pretty" | "text" => builder.try_init(),
        other => {
            return Err(Error::config(format!(
                "unknown log format '{other}', expected 'pretty' or 'json'"
            )))
        }
    };
    installed.map_err(|e| Error::config(format!("failed to install logger: {e}")))?;
    Ok(guard)
}

/// Start the Prometheus scrape endpoint when one is configured.
/// Must run inside a Tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<Option<SocketAddr>> {
    let Some(raw) = config.prometheus_addr.as_deref() else {
        return Ok(None);
    };
    let addr: SocketAddr = raw
        .parse()
        .map_err(|e| Error::config(format!("invalid metrics.prometheus_addr '{raw}': {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::config(format!("failed to start Prometheus exporter: {e}")))?;
    describe_metrics();

    info!("Prometheus metrics on http://{}/metrics", addr);
    Ok(Some(addr))
}

fn describe_metrics() {
    metrics::describe_counter!(
        "llmtracer_requests_rejected_total",
        "Requests refused by admission control"
    );
    metrics::describe_counter!(
        "llmtracer_payload_truncations_total",
        "Payload fields shortened to respect the record size ceiling"
    );
    metrics::describe_counter!(
        "llmtracer_purged_records_total",
        "Records removed by the retention sweep"
    );
    metrics::describe_counter!(
        "llmtracer_client_degraded_total",
        "Client events dropped instead of delivered"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_off_by_default() {
        assert_eq!(init_metrics(&MetricsConfig::default()).unwrap(), None);
    }

    #[test]
    fn malformed_exporter_address_is_a_config_error() {
        let config = MetricsConfig {
            prometheus_addr: Some("localhost".to_string()),
        };
        assert_eq!(init_metrics(&config).unwrap_err().code(), "internal_error");
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let config = LoggingConfig {
            format: "xml".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(init_logging(&config, false), Err(Error::Config(_))));
    }
}
