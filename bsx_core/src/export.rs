//! Metric Assembly
//!
//! Turns raw beanstalkd statistics into gauge observations, and a set of
//! observations into Prometheus metric families ready for encoding.

use std::collections::{BTreeMap, HashMap};

use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::beanstalk::StatMap;
use crate::error::Result;
use crate::help::{system_stat_help, tube_stat_help};
use crate::mapper::INSTANCE_LABEL;
use crate::metrics::ExporterMetrics;

/// Identity fields of the `stats` reply that are not metrics.
pub const IGNORED_SYSTEM_STATS: &[&str] = &["hostname", "id", "pid"];
/// Identity fields of the `stats-tube` reply that are not metrics.
pub const IGNORED_TUBE_STATS: &[&str] = &["name", "tube-name"];

/// Prefix of every per-tube metric.
pub const TUBE_METRIC_PREFIX: &str = "tube_";

/// One gauge sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub name: String,
    pub help: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Everything collected by one scrape cycle.
#[derive(Debug, Clone, Default)]
pub struct ScrapeResult {
    pub observations: Vec<Observation>,
}

impl ScrapeResult {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Observations carrying the given `tube` label.
    pub fn for_tube<'a>(&'a self, tube: &'a str) -> impl Iterator<Item = &'a Observation> + 'a {
        self.observations
            .iter()
            .filter(move |o| o.labels.get("tube").map(String::as_str) == Some(tube))
    }

    pub fn find(&self, name: &str) -> Option<&Observation> {
        self.observations.iter().find(|o| o.name == name)
    }
}

/// Stat values are decimal strings. Anything unparsable is exported as 0
/// so the series does not vanish.
pub fn parse_value(raw: &str) -> f64 {
    raw.trim().parse().unwrap_or(0.0)
}

fn metric_name(key: &str) -> String {
    key.replace('-', "_")
}

/// Gauges for the server-wide `stats` reply.
pub fn system_observations(stats: &StatMap, instance: &str) -> Vec<Observation> {
    stats
        .iter()
        .filter(|(key, _)| !IGNORED_SYSTEM_STATS.contains(&key.as_str()))
        .map(|(key, value)| Observation {
            name: metric_name(key),
            help: system_stat_help(key).unwrap_or(key.as_str()).to_string(),
            labels: BTreeMap::from([(INSTANCE_LABEL.to_string(), instance.to_string())]),
            value: parse_value(value),
        })
        .collect()
}

/// Gauges for one `stats-tube` reply, all sharing `labels`.
pub fn tube_observations(stats: &StatMap, labels: &BTreeMap<String, String>) -> Vec<Observation> {
    stats
        .iter()
        .filter(|(key, _)| !IGNORED_TUBE_STATS.contains(&key.as_str()))
        .map(|(key, value)| Observation {
            name: format!("{TUBE_METRIC_PREFIX}{}", metric_name(key)),
            help: tube_stat_help(key).unwrap_or(key.as_str()).to_string(),
            labels: labels.clone(),
            value: parse_value(value),
        })
        .collect()
}

/// Declare one gauge family per metric name and fill it with this cycle's
/// values.
///
/// The label schema of a family is taken from its first observation. A
/// family Prometheus refuses to declare is skipped.
pub fn scrape_families(result: &ScrapeResult) -> Vec<MetricFamily> {
    let mut groups: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
    for observation in &result.observations {
        groups.entry(observation.name.as_str()).or_default().push(observation);
    }

    let registry = Registry::new();
    for (name, observations) in groups {
        let Some(first) = observations.first() else {
            continue;
        };
        let label_names: Vec<&str> = first.labels.keys().map(String::as_str).collect();
        let gauges = match GaugeVec::new(Opts::new(name, first.help.as_str()), &label_names) {
            Ok(gauges) => gauges,
            Err(e) => {
                tracing::warn!(metric = name, error = %e, "skipping metric");
                continue;
            }
        };

        for observation in observations {
            let labels: HashMap<&str, &str> = observation
                .labels
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            match gauges.get_metric_with(&labels) {
                Ok(gauge) => gauge.set(observation.value),
                Err(e) => tracing::warn!(metric = name, error = %e, "skipping sample"),
            }
        }

        if let Err(e) = registry.register(Box::new(gauges)) {
            tracing::warn!(metric = name, error = %e, "skipping metric");
        }
    }
    registry.gather()
}

/// Target metrics of `result` followed by the exporter's own, sorted by name.
pub fn gather(result: &ScrapeResult, metrics: &ExporterMetrics) -> Vec<MetricFamily> {
    let mut families = scrape_families(result);
    families.extend(metrics.registry().gather());
    families.sort_by(|a, b| a.get_name().cmp(b.get_name()));
    families
}

/// Encode metric families in the Prometheus text format.
pub fn encode_text(families: &[MetricFamily]) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
