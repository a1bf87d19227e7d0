/*!
Logging setup and optional Prometheus metrics.

Logging goes through `tracing`; [`init_logging`] installs a subscriber with an
`EnvFilter` (default `keepsql=info`) and either human-readable or JSON output.

With the `metrics` feature enabled, save activity is also recorded in a
process-wide Prometheus registry that can be rendered with [`gather_metrics`].
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{KeepError, Result};

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<KeepMetrics>> = OnceLock::new();

/// Save metrics
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct KeepMetrics {
    pub saves_total: Counter,
    pub save_failures_total: Counter,
    pub save_latency_seconds: Histogram,
    pub snapshot_size_bytes: Histogram,
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl KeepMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let saves_total = Counter::new("keepsql_saves_total", "Snapshot saves completed")
            .map_err(|e| KeepError::storage(format!("Failed to create saves_total metric: {e}")))?;

        let save_failures_total =
            Counter::new("keepsql_save_failures_total", "Snapshot saves that failed").map_err(
                |e| KeepError::storage(format!("Failed to create save_failures_total metric: {e}")),
            )?;

        let save_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "keepsql_save_latency_seconds",
            "Duration of snapshot saves in seconds",
        ))
        .map_err(|e| {
            KeepError::storage(format!("Failed to create save_latency_seconds metric: {e}"))
        })?;

        let snapshot_size_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "keepsql_snapshot_size_bytes",
                "Uncompressed size of saved snapshots",
            )
            .buckets(prometheus::exponential_buckets(4096.0, 4.0, 10).map_err(|e| {
                KeepError::storage(format!("Failed to build snapshot size buckets: {e}"))
            })?),
        )
        .map_err(|e| {
            KeepError::storage(format!("Failed to create snapshot_size_bytes metric: {e}"))
        })?;

        registry
            .register(Box::new(saves_total.clone()))
            .map_err(|e| KeepError::storage(format!("Failed to register saves_total: {e}")))?;
        registry
            .register(Box::new(save_failures_total.clone()))
            .map_err(|e| {
                KeepError::storage(format!("Failed to register save_failures_total: {e}"))
            })?;
        registry
            .register(Box::new(save_latency_seconds.clone()))
            .map_err(|e| {
                KeepError::storage(format!("Failed to register save_latency_seconds: {e}"))
            })?;
        registry
            .register(Box::new(snapshot_size_bytes.clone()))
            .map_err(|e| {
                KeepError::storage(format!("Failed to register snapshot_size_bytes: {e}"))
            })?;

        Ok(Self {
            saves_total,
            save_failures_total,
            save_latency_seconds,
            snapshot_size_bytes,
            registry,
        })
    }

    /// The process-wide metrics, `None` if they could not be registered
    pub fn global() -> Option<&'static KeepMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!("Metrics disabled: {}", e);
                    None
                }
            })
            .as_ref()
    }

    /// Render the registry in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| KeepError::storage(format!("Failed to encode metrics: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| KeepError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Record the outcome of one save attempt
pub(crate) fn record_save(duration: Duration, succeeded: bool) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeepMetrics::global() {
        metrics.save_latency_seconds.observe(duration.as_secs_f64());
        if succeeded {
            metrics.saves_total.inc();
        } else {
            metrics.save_failures_total.inc();
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (duration, succeeded);
}

/// Record the size of an image handed to the store
pub(crate) fn record_snapshot_size(size_bytes: usize) {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeepMetrics::global() {
        metrics.snapshot_size_bytes.observe(size_bytes as f64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = size_bytes;
}

/// Metrics in Prometheus text format
///
/// Empty when the `metrics` feature is disabled.
pub fn gather_metrics() -> Result<String> {
    #[cfg(feature = "metrics")]
    if let Some(metrics) = KeepMetrics::global() {
        return metrics.gather();
    }
    Ok(String::new())
}

/// Install the global tracing subscriber
///
/// `verbose` lowers the default level to `debug`; `RUST_LOG` still takes
/// precedence. Fails if a subscriber is already installed.
pub fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let default_directive = if verbose { "keepsql=debug" } else { "keepsql=info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| KeepError::validation(format!("Invalid log filter: {e}")))?;

    let result = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };
    result.map_err(|e| {
        KeepError::storage(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Logging initialized (json: {})", json);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails_cleanly() {
        // Another test may have installed a subscriber already.
        let _ = init_logging(false, true);
        assert!(init_logging(true, false).is_err());
    }

    #[cfg(not(feature = "metrics"))]
    #[test]
    fn test_gather_without_metrics_is_empty() {
        record_save(Duration::from_millis(5), true);
        assert_eq!(gather_metrics().unwrap(), "");
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_gather_reports_saves() {
        record_save(Duration::from_millis(5), true);
        record_save(Duration::from_millis(7), false);
        record_snapshot_size(8192);

        let text = gather_metrics().unwrap();
        assert!(text.contains("keepsql_saves_total"));
        assert!(text.contains("keepsql_save_failures_total"));
        assert!(text.contains("keepsql_snapshot_size_bytes"));
    }
}
