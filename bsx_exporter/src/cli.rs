//! Command line flags.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bsx_core::config::{ExporterConfig, FileConfig};
use bsx_core::logging::LogFormat;
use bsx_core::ConfigError;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "beanstalkd-exporter", author, version, about = "Prometheus exporter for beanstalkd", long_about = None)]
pub struct Args {
    /// YAML settings file; explicit flags override its values
    #[arg(long = "config.file")]
    pub config_file: Option<PathBuf>,

    /// Beanstalkd server address [default: localhost:11300]
    #[arg(long = "beanstalkd.address")]
    pub address: Option<String>,

    /// Connection attempts after the first failed one [default: 2]
    #[arg(long = "beanstalkd.connect-retries")]
    pub connect_retries: Option<u32>,

    /// Milliseconds to wait between connection attempts [default: 5000]
    #[arg(long = "beanstalkd.retry-delay")]
    pub retry_delay_ms: Option<u64>,

    /// Milliseconds allowed for establishing the TCP connection [default: 5000]
    #[arg(long = "beanstalkd.dial-timeout")]
    pub dial_timeout_ms: Option<u64>,

    /// Milliseconds to wait for a reply, 0 waits forever [default: 10000]
    #[arg(long = "beanstalkd.read-timeout")]
    pub read_timeout_ms: Option<u64>,

    /// The log level
    #[arg(long = "log.level", default_value = "warning")]
    pub log_level: String,

    /// Log output format (text or json)
    #[arg(long = "log.format", default_value = "text")]
    pub log_format: LogFormat,

    /// A file that describes a mapping of tube names
    #[arg(long = "mapping-config")]
    pub mapping_config: Option<PathBuf>,

    /// The number of milliseconds to sleep between tube stats [default: 5000]
    #[arg(long = "sleep-between-tube-stats")]
    pub sleep_between_tube_stats_ms: Option<u64>,

    /// The number of concurrent workers to use to fetch tube stats [default: 1]
    #[arg(long = "num-tube-stat-workers")]
    pub tube_stat_workers: Option<usize>,

    /// Export global stats only
    #[arg(long = "disable-tube-stats")]
    pub disable_tube_stats: bool,

    /// Scrape in the background every N seconds and serve the latest result
    #[arg(long = "poll")]
    pub poll_secs: Option<u64>,

    /// Milliseconds one scrape cycle may take before it is abandoned
    #[arg(long = "scrape-timeout")]
    pub scrape_timeout_ms: Option<u64>,

    /// Address to listen on for web interface and telemetry
    #[arg(long = "web.listen-address", default_value = ":8080", value_parser = parse_listen_address)]
    pub listen_address: SocketAddr,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    pub telemetry_path: String,
}

/// Accepts `host:port` as well as the bare `:port` form.
pub fn parse_listen_address(value: &str) -> Result<SocketAddr, String> {
    let value = value.trim();
    let full = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };
    full.parse()
        .map_err(|e| format!("invalid listen address '{value}': {e}"))
}

impl Args {
    /// Defaults, then the settings file, then explicit flags.
    pub fn to_config(&self) -> Result<ExporterConfig, ConfigError> {
        let mut builder = match &self.config_file {
            Some(path) => FileConfig::load(path)?.into_builder(),
            None => ExporterConfig::builder(),
        };

        if let Some(address) = &self.address {
            builder = builder.address(address.clone());
        }
        if let Some(retries) = self.connect_retries {
            builder = builder.connect_retries(retries);
        }
        if let Some(ms) = self.retry_delay_ms {
            builder = builder.retry_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.dial_timeout_ms {
            builder = builder.dial_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.read_timeout_ms {
            builder = builder.read_timeout((ms > 0).then(|| Duration::from_millis(ms)));
        }
        if let Some(path) = &self.mapping_config {
            builder = builder.mapping_config(Some(path.clone()));
        }
        if let Some(ms) = self.sleep_between_tube_stats_ms {
            builder = builder.sleep_between_tube_stats(Duration::from_millis(ms));
        }
        if let Some(workers) = self.tube_stat_workers {
            builder = builder.tube_stat_workers(workers);
        }
        if self.disable_tube_stats {
            builder = builder.collect_tube_stats(false);
        }
        if let Some(secs) = self.poll_secs {
            builder = builder.poll_interval(Some(Duration::from_secs(secs)));
        }
        if let Some(ms) = self.scrape_timeout_ms {
            builder = builder.cycle_timeout(Some(Duration::from_millis(ms)));
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }
}
