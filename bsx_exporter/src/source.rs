//! Where the HTTP handler gets its metric families from.

use async_trait::async_trait;
use bsx_core::QueueClient;
use bsx_core::Scraper;
use prometheus::proto::MetricFamily;

#[async_trait]
pub trait MetricsSource: Send + Sync + 'static {
    async fn families(&self) -> Vec<MetricFamily>;
}

/// Scrapes beanstalkd on every request.
#[async_trait]
impl<C: QueueClient> MetricsSource for Scraper<C> {
    async fn families(&self) -> Vec<MetricFamily> {
        self.collect().await
    }
}

