//! Background scraping.
//!
//! With `--poll` set, cycles run on a fixed interval and every HTTP request
//! is answered from the most recent result instead of hitting beanstalkd.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bsx_core::export;
use bsx_core::{QueueClient, ScrapeResult, Scraper};
use prometheus::proto::MetricFamily;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;

use crate::source::MetricsSource;

pub struct Poller<C: QueueClient> {
    scraper: Arc<Scraper<C>>,
    interval: Duration,
    latest: RwLock<Arc<ScrapeResult>>,
}

impl<C: QueueClient> Poller<C> {
    pub fn new(scraper: Arc<Scraper<C>>, interval: Duration) -> Self {
        Self {
            scraper,
            interval,
            latest: RwLock::new(Arc::new(ScrapeResult::default())),
        }
    }

    /// Run one cycle and publish its result.
    pub async fn poll_once(&self) {
        let result = self.scraper.run_scrape().await;
        tracing::debug!(observations = result.len(), "poll cycle finished");
        *self.latest.write().await = Arc::new(result);
    }

    pub async fn latest(&self) -> Arc<ScrapeResult> {
        self.latest.read().await.clone()
    }

    /// Poll until `shutdown` flips to true. The first cycle starts
    /// immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // A slow cycle must not be followed by a burst of catch-up cycles.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval = ?self.interval, "background polling started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("background polling stopped");
    }
}

#[async_trait]
impl<C: QueueClient> MetricsSource for Poller<C> {
    async fn families(&self) -> Vec<MetricFamily> {
        let latest = self.latest().await;
        export::gather(&latest, self.scraper.metrics())
    }
}
