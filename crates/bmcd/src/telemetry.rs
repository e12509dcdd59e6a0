//! Process-wide logging and metrics handles.
//!
//! Built once in `main`, handed to services at construction time, torn
//! down after the supervisor unwinds.
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install the console tracing subscriber. `RUST_LOG` overrides `default`.
pub fn init_tracing(default: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Power-manager metrics on one shared registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub operations_total: IntCounterVec,
    pub operation_duration_seconds: HistogramVec,
    pub power_cycles_total: IntCounterVec,
    pub failures_total: IntCounterVec,
    pub capture_errors_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let operations_total = IntCounterVec::new(
            Opts::new("operations_total", "Power operations executed"),
            &["component", "operation"],
        )
        .expect("metric definition");
        let operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Power operation latency"),
            &["component", "operation"],
        )
        .expect("metric definition");
        let power_cycles_total = IntCounterVec::new(
            Opts::new("power_cycles_total", "Full power cycles executed"),
            &["component"],
        )
        .expect("metric definition");
        let failures_total = IntCounterVec::new(
            Opts::new("failures_total", "Failed power operations"),
            &["component", "operation"],
        )
        .expect("metric definition");
        let capture_errors_total = IntCounterVec::new(
            Opts::new("capture_errors_total", "Video capture errors"),
            &["device"],
        )
        .expect("metric definition");

        for collector in [
            Box::new(operations_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(operation_duration_seconds.clone()),
            Box::new(power_cycles_total.clone()),
            Box::new(failures_total.clone()),
            Box::new(capture_errors_total.clone()),
        ] {
            registry.register(collector).expect("metric registration");
        }

        Self {
            registry,
            operations_total,
            operation_duration_seconds,
            power_cycles_total,
            failures_total,
            capture_errors_total,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch, for published events.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_count() {
        let metrics = Metrics::new();
        metrics
            .operations_total
            .with_label_values(&["host.0", "power_on"])
            .inc();
        metrics
            .failures_total
            .with_label_values(&["host.0", "power_on"])
            .inc();
        let families = metrics.registry().gather();
        assert!(families.iter().any(|f| f.get_name() == "operations_total"));
        assert!(families.iter().any(|f| f.get_name() == "failures_total"));
    }

    #[test]
    fn unix_millis_is_nonzero() {
        assert!(unix_millis() > 0);
    }
}
