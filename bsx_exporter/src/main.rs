use std::sync::Arc;

use anyhow::Context;
use bsx_core::logging::init_logging;
use bsx_core::{BeanstalkClient, ExporterMetrics, Scraper, TubeMapper};
use bsx_exporter::watcher::{initial_load, MappingWatcher};
use bsx_exporter::{Args, MetricsServer, MetricsSource, Poller};
use clap::Parser;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_format)?;
    let config = args.to_config()?;

    tracing::info!("Starting beanstalkd exporter...");
    tracing::info!("Beanstalkd address: {}", config.address);

    let metrics = Arc::new(ExporterMetrics::new()?);
    let mapper = Arc::new(TubeMapper::with_metrics(metrics.clone()));

    let _watcher = match &config.mapping_config {
        Some(path) => {
            initial_load(path, &mapper)
                .with_context(|| format!("Error parsing mapping config {}", path.display()))?;
            Some(MappingWatcher::start(path.clone(), mapper.clone())?)
        }
        None => None,
    };

    let client = BeanstalkClient::from_config(&config);
    let scraper = Arc::new(Scraper::new(client, mapper, metrics, &config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source: Arc<dyn MetricsSource> = match config.poll_interval {
        Some(interval) => {
            let poller = Arc::new(Poller::new(scraper, interval));
            tokio::spawn(poller.clone().run(shutdown_rx.clone()));
            poller
        }
        None => scraper,
    };

    let mut server_shutdown = shutdown_rx.clone();
    let server = MetricsServer::new(args.listen_address, args.telemetry_path.clone(), source);
    let (addr, mut handle) = server.start(async move {
        let _ = server_shutdown.changed().await;
    })?;
    tracing::info!("Serving metrics on http://{}{}", addr, args.telemetry_path);

    tokio::select! {
        served = &mut handle => served??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            let _ = shutdown_tx.send(true);
            handle.await??;
        }
    }

    Ok(())
}
