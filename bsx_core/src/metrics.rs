//! Exporter Self-Metrics
//!
//! Counters and gauges describing the exporter itself, as opposed to the
//! beanstalkd statistics it republishes.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

const NAMESPACE: &str = "beanstalkd";
const SUBSYSTEM: &str = "exporter";

/// Result label used by the outcome counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE).subsystem(SUBSYSTEM)
}

/// Registry holding the exporter's own metrics.
#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,

    pub requests_total: IntCounterVec,
    pub connection_errors_total: IntCounter,
    pub scrape_seconds: Histogram,
    pub config_reloads_total: IntCounterVec,
    pub loaded_mappings: IntGauge,
}

impl ExporterMetrics {
    /// Create and register all exporter metrics in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts("requests_total", "The number of request to beanstalkd."),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let connection_errors_total = IntCounter::with_opts(opts(
            "scrape_connection_errors_total",
            "Total number of connection errors to beanstalkd.",
        ))?;
        registry.register(Box::new(connection_errors_total.clone()))?;

        let scrape_seconds = Histogram::with_opts(
            HistogramOpts::new("scrape_seconds", "Scrape time buckets.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM),
        )?;
        registry.register(Box::new(scrape_seconds.clone()))?;

        let config_reloads_total = IntCounterVec::new(
            opts("config_reloads_total", "The number of configuration reloads."),
            &["outcome"],
        )?;
        registry.register(Box::new(config_reloads_total.clone()))?;

        let loaded_mappings = IntGauge::with_opts(opts(
            "loaded_mappings_count",
            "The number of configured metric mappings.",
        ))?;
        registry.register(Box::new(loaded_mappings.clone()))?;

        // Pre-create both outcomes so they are exported as zero.
        for outcome in [Outcome::Success, Outcome::Failure] {
            requests_total.with_label_values(&[outcome.as_str()]);
            config_reloads_total.with_label_values(&[outcome.as_str()]);
        }

        Ok(Self {
            registry,
            requests_total,
            connection_errors_total,
            scrape_seconds,
            config_reloads_total,
            loaded_mappings,
        })
    }

    /// Get the underlying Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request(&self, outcome: Outcome) {
        self.requests_total.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_connection_error(&self) {
        self.connection_errors_total.inc();
    }

    pub fn observe_scrape(&self, duration_secs: f64) {
        self.scrape_seconds.observe(duration_secs);
    }

    pub fn record_config_reload(&self, outcome: Outcome) {
        self.config_reloads_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    pub fn set_loaded_mappings(&self, count: usize) {
        self.loaded_mappings.set(count as i64);
    }

    pub fn requests(&self, outcome: Outcome) -> u64 {
        self.requests_total.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn connection_errors(&self) -> u64 {
        self.connection_errors_total.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        let metrics = ExporterMetrics::new().unwrap();
        metrics.record_request(Outcome::Success);
        metrics.record_connection_error();
        metrics.observe_scrape(0.25);

        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "beanstalkd_exporter_config_reloads_total",
                "beanstalkd_exporter_loaded_mappings_count",
                "beanstalkd_exporter_requests_total",
                "beanstalkd_exporter_scrape_connection_errors_total",
                "beanstalkd_exporter_scrape_seconds",
            ]
        );
    }

    #[test]
    fn test_outcome_counters_start_at_zero() {
        let metrics = ExporterMetrics::new().unwrap();
        assert_eq!(metrics.requests(Outcome::Success), 0);
        assert_eq!(metrics.requests(Outcome::Failure), 0);

        metrics.record_request(Outcome::Failure);
        metrics.record_request(Outcome::Failure);
        assert_eq!(metrics.requests(Outcome::Failure), 2);
        assert_eq!(metrics.requests(Outcome::Success), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let metrics = ExporterMetrics::new().unwrap();
        let other = metrics.clone();
        other.record_connection_error();
        assert_eq!(metrics.connection_errors(), 1);
    }
}
