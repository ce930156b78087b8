//! # bsx_core
//!
//! Building blocks of the beanstalkd exporter:
//!
//! - **Tube mapping** ([`mapper`]): regex rules turning tube names into labels,
//!   hot-swapped without blocking scrapes
//! - **Lazy connection** ([`lazy_conn`]): dials on first use and after every drop
//! - **Stats client** ([`beanstalk`]): `stats`, `list-tubes`, `stats-tube`
//! - **Scrape cycle** ([`scrape`]): retries, worker fan-out, throttling
//! - **Metric assembly** ([`export`]): observations to Prometheus families

pub mod beanstalk;
pub mod config;
pub mod error;
pub mod export;
pub mod help;
pub mod lazy_conn;
pub mod logging;
pub mod mapper;
pub mod metrics;
pub mod scrape;

pub use beanstalk::{BeanstalkClient, QueueClient, StatMap};
pub use config::ExporterConfig;
pub use error::{ConfigError, ExporterError};
pub use export::{Observation, ScrapeResult};
pub use mapper::{RuleSet, TubeMapper};
pub use metrics::{ExporterMetrics, Outcome};
pub use scrape::Scraper;
