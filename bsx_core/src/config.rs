use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Exporter configuration
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Beanstalkd server address (host:port)
    pub address: String,
    /// Timeout for establishing a TCP connection
    pub dial_timeout: Duration,
    /// Deadline applied to every read (None = wait forever)
    pub read_timeout: Option<Duration>,
    /// Additional connection attempts after the first one fails
    pub connect_retries: u32,
    /// Pause between connection attempts
    pub retry_delay: Duration,
    /// Number of concurrent workers fetching tube stats
    pub tube_stat_workers: usize,
    /// Pause each worker takes between two tube stats requests
    pub sleep_between_tube_stats: Duration,
    /// Fetch per-tube stats (false = global stats only)
    pub collect_tube_stats: bool,
    /// Optional tube mapping file, reloaded when it changes
    pub mapping_config: Option<PathBuf>,
    /// Scrape in the background at this interval instead of per request
    pub poll_interval: Option<Duration>,
    /// Upper bound on the duration of one scrape cycle
    pub cycle_timeout: Option<Duration>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            address: "localhost:11300".to_string(),
            dial_timeout: Duration::from_secs(5),
            read_timeout: Some(Duration::from_secs(10)),
            connect_retries: 2,
            retry_delay: Duration::from_secs(5),
            tube_stat_workers: 1,
            sleep_between_tube_stats: Duration::from_millis(5000),
            collect_tube_stats: true,
            mapping_config: None,
            poll_interval: None, // Scrape on demand
            cycle_timeout: None,
        }
    }
}

impl ExporterConfig {
    pub fn builder() -> ExporterConfigBuilder {
        ExporterConfigBuilder::default()
    }

    /// Reject settings the scrape loop cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::Invalid("beanstalkd address is empty".to_string()));
        }
        if self.tube_stat_workers == 0 {
            return Err(ConfigError::Invalid(
                "number of tube stat workers must be at least 1".to_string(),
            ));
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::Invalid("dial timeout must be positive".to_string()));
        }
        if matches!(self.poll_interval, Some(interval) if interval.is_zero()) {
            return Err(ConfigError::Invalid("poll interval must be positive".to_string()));
        }
        if matches!(self.cycle_timeout, Some(timeout) if timeout.is_zero()) {
            return Err(ConfigError::Invalid("scrape timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Settings file layout. Every key is optional; durations are in
/// milliseconds.
///
/// ```yaml
/// address: queue.internal:11300
/// tube_stat_workers: 2
/// sleep_between_tube_stats_ms: 250
/// mapping_config: /etc/beanstalkd-exporter/mapping.conf
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub address: Option<String>,
    pub dial_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub connect_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub tube_stat_workers: Option<usize>,
    pub sleep_between_tube_stats_ms: Option<u64>,
    pub collect_tube_stats: Option<bool>,
    pub mapping_config: Option<PathBuf>,
    pub poll_interval_ms: Option<u64>,
    pub cycle_timeout_ms: Option<u64>,
}

impl FileConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Invalid(format!("settings file: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Builder pre-filled with the keys present in the file.
    pub fn into_builder(self) -> ExporterConfigBuilder {
        // A read timeout of 0 means "wait forever".
        let read_timeout = self
            .read_timeout_ms
            .map(|ms| (ms > 0).then(|| Duration::from_millis(ms)));

        ExporterConfigBuilder {
            address: self.address,
            dial_timeout: self.dial_timeout_ms.map(Duration::from_millis),
            read_timeout,
            connect_retries: self.connect_retries,
            retry_delay: self.retry_delay_ms.map(Duration::from_millis),
            tube_stat_workers: self.tube_stat_workers,
            sleep_between_tube_stats: self.sleep_between_tube_stats_ms.map(Duration::from_millis),
            collect_tube_stats: self.collect_tube_stats,
            mapping_config: self.mapping_config.map(Some),
            poll_interval: self.poll_interval_ms.map(|ms| Some(Duration::from_millis(ms))),
            cycle_timeout: self.cycle_timeout_ms.map(|ms| Some(Duration::from_millis(ms))),
        }
    }
}

/// Builder for ExporterConfig
#[derive(Debug, Default)]
pub struct ExporterConfigBuilder {
    address: Option<String>,
    dial_timeout: Option<Duration>,
    read_timeout: Option<Option<Duration>>,
    connect_retries: Option<u32>,
    retry_delay: Option<Duration>,
    tube_stat_workers: Option<usize>,
    sleep_between_tube_stats: Option<Duration>,
    collect_tube_stats: Option<bool>,
    mapping_config: Option<Option<PathBuf>>,
    poll_interval: Option<Option<Duration>>,
    cycle_timeout: Option<Option<Duration>>,
}

impl ExporterConfigBuilder {
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn tube_stat_workers(mut self, workers: usize) -> Self {
        self.tube_stat_workers = Some(workers);
        self
    }

    pub fn sleep_between_tube_stats(mut self, sleep: Duration) -> Self {
        self.sleep_between_tube_stats = Some(sleep);
        self
    }

    pub fn collect_tube_stats(mut self, enable: bool) -> Self {
        self.collect_tube_stats = Some(enable);
        self
    }

    pub fn mapping_config(mut self, path: Option<PathBuf>) -> Self {
        self.mapping_config = Some(path);
        self
    }

    pub fn poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn cycle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cycle_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ExporterConfig {
        let default = ExporterConfig::default();
        ExporterConfig {
            address: self.address.unwrap_or(default.address),
            dial_timeout: self.dial_timeout.unwrap_or(default.dial_timeout),
            read_timeout: self.read_timeout.unwrap_or(default.read_timeout),
            connect_retries: self.connect_retries.unwrap_or(default.connect_retries),
            retry_delay: self.retry_delay.unwrap_or(default.retry_delay),
            tube_stat_workers: self.tube_stat_workers.unwrap_or(default.tube_stat_workers),
            sleep_between_tube_stats: self.sleep_between_tube_stats.unwrap_or(default.sleep_between_tube_stats),
            collect_tube_stats: self.collect_tube_stats.unwrap_or(default.collect_tube_stats),
            mapping_config: self.mapping_config.unwrap_or(default.mapping_config),
            poll_interval: self.poll_interval.unwrap_or(default.poll_interval),
            cycle_timeout: self.cycle_timeout.unwrap_or(default.cycle_timeout),
        }
    }
}
