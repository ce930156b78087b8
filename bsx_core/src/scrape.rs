//! Scrape Cycle
//!
//! One cycle walks the same steps every time:
//!
//! 1. make sure the connection to beanstalkd is up (bounded retries),
//! 2. `stats` for the server-wide gauges,
//! 3. `list-tubes`,
//! 4. `stats-tube` for every tube, spread over a small worker pool.
//!
//! Cycles never overlap: a second caller waits for the running cycle to
//! finish. Workers share the single client, so only one request is ever in
//! flight against the server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::proto::MetricFamily;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::beanstalk::QueueClient;
use crate::config::ExporterConfig;
use crate::error::{ExporterError, Result};
use crate::export::{self, system_observations, tube_observations, Observation, ScrapeResult};
use crate::mapper::{RuleSet, TubeMapper};
use crate::metrics::{ExporterMetrics, Outcome};

/// Settings of the scrape loop, taken from [`ExporterConfig`].
#[derive(Debug, Clone)]
struct ScrapeSettings {
    connect_retries: u32,
    retry_delay: Duration,
    workers: usize,
    sleep_between_tube_stats: Duration,
    collect_tube_stats: bool,
    cycle_timeout: Option<Duration>,
}

impl From<&ExporterConfig> for ScrapeSettings {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            connect_retries: config.connect_retries,
            retry_delay: config.retry_delay,
            workers: config.tube_stat_workers.max(1),
            sleep_between_tube_stats: config.sleep_between_tube_stats,
            collect_tube_stats: config.collect_tube_stats,
            cycle_timeout: config.cycle_timeout,
        }
    }
}

/// Drives scrape cycles against one beanstalkd server.
pub struct Scraper<C: QueueClient> {
    client: Arc<Mutex<C>>,
    address: String,
    mapper: Arc<TubeMapper>,
    metrics: Arc<ExporterMetrics>,
    settings: ScrapeSettings,
    cycle: Mutex<()>,
}

impl<C: QueueClient> Scraper<C> {
    pub fn new(
        client: C,
        mapper: Arc<TubeMapper>,
        metrics: Arc<ExporterMetrics>,
        config: &ExporterConfig,
    ) -> Self {
        Self {
            address: client.address().to_string(),
            client: Arc::new(Mutex::new(client)),
            mapper,
            metrics,
            settings: ScrapeSettings::from(config),
            cycle: Mutex::new(()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mapper(&self) -> &Arc<TubeMapper> {
        &self.mapper
    }

    pub fn metrics(&self) -> &Arc<ExporterMetrics> {
        &self.metrics
    }

    /// Run one complete cycle. Waits for any cycle already running.
    pub async fn run_scrape(&self) -> ScrapeResult {
        let _cycle = self.cycle.lock().await;
        let start = Instant::now();

        let result = match self.settings.cycle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.scrape()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(address = %self.address, timeout = ?limit, "scrape cycle timed out");
                    self.metrics.record_request(Outcome::Failure);
                    // The conversation may have been cut mid-reply.
                    self.client.lock().await.disconnect().await;
                    ScrapeResult::default()
                }
            },
            None => self.scrape().await,
        };

        self.metrics.observe_scrape(start.elapsed().as_secs_f64());
        result
    }

    /// Run a cycle and return its metric families merged with the
    /// exporter's own.
    pub async fn collect(&self) -> Vec<MetricFamily> {
        let result = self.run_scrape().await;
        export::gather(&result, &self.metrics)
    }

    async fn scrape(&self) -> ScrapeResult {
        let mut result = ScrapeResult::default();

        if let Err(e) = self.acquire().await {
            tracing::error!(address = %self.address, error = %e, "Can't connect to beanstalkd");
            return result;
        }

        // One snapshot per cycle keeps the label schema uniform even if the
        // mapping is reloaded meanwhile.
        let rules = self.mapper.snapshot();

        let stats = self.client.lock().await.stats().await;
        let stats = match self.outcome("stats", stats) {
            Some(stats) => stats,
            None => return result,
        };
        result
            .observations
            .extend(system_observations(&stats, &self.address));

        if !self.settings.collect_tube_stats {
            return result;
        }

        let tubes = self.client.lock().await.list_tubes().await;
        let tubes = match self.outcome("list-tubes", tubes) {
            Some(tubes) => tubes,
            None => return result,
        };

        result.observations.extend(self.fan_out(tubes, rules).await);
        result
    }

    fn outcome<T>(&self, command: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.metrics.record_request(Outcome::Success);
                Some(value)
            }
            Err(e) => {
                tracing::error!(address = %self.address, command, error = %e, "Error requesting beanstalkd");
                self.metrics.record_request(Outcome::Failure);
                None
            }
        }
    }

    /// One connection attempt plus `connect_retries` more, each failure
    /// counted as a connection error.
    async fn acquire(&self) -> Result<()> {
        let attempts = self.settings.connect_retries.saturating_add(1);
        let mut client = self.client.lock().await;

        for attempt in 1..=attempts {
            match client.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.metrics.record_connection_error();
                    tracing::error!(
                        address = %self.address,
                        attempt,
                        attempts,
                        error = %e,
                        "Can't connect to beanstalkd"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_delay).await;
                    }
                }
            }
        }
        Err(ExporterError::ConnectRetriesExhausted { attempts })
    }

    async fn fan_out(&self, tubes: Vec<String>, rules: Arc<RuleSet>) -> Vec<Observation> {
        if tubes.is_empty() {
            return Vec::new();
        }

        let (tx, rx) = mpsc::channel(tubes.len());
        for tube in tubes {
            if tx.send(tube).await.is_err() {
                break;
            }
        }
        drop(tx);
        let queue = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for id in 0..self.settings.workers {
            let worker = TubeWorker {
                id,
                queue: queue.clone(),
                client: self.client.clone(),
                rules: rules.clone(),
                metrics: self.metrics.clone(),
                address: self.address.clone(),
                sleep: self.settings.sleep_between_tube_stats,
            };
            workers.spawn(worker.run());
        }

        let mut observations = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(batch) => observations.extend(batch),
                Err(e) => tracing::error!(error = %e, "tube stats worker failed"),
            }
        }
        observations
    }
}

struct TubeWorker<C: QueueClient> {
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<String>>>,
    client: Arc<Mutex<C>>,
    rules: Arc<RuleSet>,
    metrics: Arc<ExporterMetrics>,
    address: String,
    sleep: Duration,
}

impl<C: QueueClient> TubeWorker<C> {
    async fn run(self) -> Vec<Observation> {
        tracing::debug!(worker = self.id, "scrape worker started");

        let mut observations = Vec::new();
        let mut fetched = 0usize;
        loop {
            let next = self.queue.lock().await.recv().await;
            let Some(tube) = next else {
                break;
            };
            if fetched > 0 && !self.sleep.is_zero() {
                tokio::time::sleep(self.sleep).await;
            }
            fetched += 1;
            observations.extend(self.stat_tube(&tube).await);
        }

        tracing::debug!(worker = self.id, tubes = fetched, "scrape worker finished");
        observations
    }

    async fn stat_tube(&self, tube: &str) -> Vec<Observation> {
        tracing::debug!(worker = self.id, tube, "fetching tube stats");
        let labels = self.rules.resolve(tube, &self.address).labels;

        let stats = self.client.lock().await.tube_stats(tube).await;
        match stats {
            Ok(stats) => {
                self.metrics.record_request(Outcome::Success);
                tube_observations(&stats, &labels)
            }
            Err(e) => {
                tracing::error!(address = %self.address, tube, error = %e, "Error tubes stats");
                self.metrics.record_request(Outcome::Failure);
                Vec::new()
            }
        }
    }
}
