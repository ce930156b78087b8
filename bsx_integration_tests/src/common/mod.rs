// Common test utilities for integration tests
#![allow(dead_code)]

pub mod fake_beanstalkd;

pub use fake_beanstalkd::FakeBeanstalkd;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bsx_core::{BeanstalkClient, ExporterConfig, ExporterMetrics, Scraper, TubeMapper};
use bsx_core::lazy_conn::TcpDialer;
use tempfile::TempDir;

pub type TcpScraper = Scraper<BeanstalkClient<TcpDialer>>;

/// Config pointing at `address` with every delay cut down to test scale.
pub fn test_config(address: &str) -> ExporterConfig {
    ExporterConfig::builder()
        .address(address)
        .dial_timeout(Duration::from_secs(1))
        .read_timeout(Some(Duration::from_secs(2)))
        .retry_delay(Duration::from_millis(10))
        .sleep_between_tube_stats(Duration::ZERO)
        .build()
}

/// Scraper over a real TCP client, with fresh metrics and an empty mapper.
pub fn tcp_scraper(config: &ExporterConfig) -> Arc<TcpScraper> {
    let metrics = Arc::new(ExporterMetrics::new().expect("Failed to create metrics"));
    let mapper = Arc::new(TubeMapper::with_metrics(metrics.clone()));
    let client = BeanstalkClient::from_config(config);
    Arc::new(Scraper::new(client, mapper, metrics, config))
}

/// Write a mapping file into a fresh temporary directory
pub fn write_mapping(content: &str) -> (TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("mapping.conf");
    std::fs::write(&path, content).expect("Failed to write mapping file");
    (temp_dir, path)
}

/// GET `path` from a server on `addr`, returning status and body
pub async fn http_get(addr: std::net::SocketAddr, path: &str) -> anyhow::Result<(u16, String)> {
    let client = hyper::Client::new();
    let uri: hyper::Uri = format!("http://{addr}{path}").parse()?;
    let response = client.get(uri).await?;
    let status = response.status().as_u16();
    let body = hyper::body::to_bytes(response.into_body()).await?;
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}
