use anyhow::Result;
use egress_ovsdb::OvsdbNbClient;
use kube::Client;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod error;
mod feed;
mod metrics;

use config::{Config, LogFormat};
use controller::Context;
use feed::KubeFeed;
use metrics::Metrics;

fn tracing_init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Plain => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    tracing_init(config.log_format);

    info!("Starting egress-controller...");
    info!("  - Northbound database: {}", config.nb_address);
    info!("  - Default VPC: {}", config.cluster_router);

    let nb = OvsdbNbClient::connect(&config.nb_address, config.nb_timeout).await?;
    info!("Connected to northbound database");

    let client = Client::try_default().await?;
    let metrics = Metrics::new()?;

    let metrics_addr = config.metrics_addr;
    let served = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr, served).await {
            error!("Metrics server error: {}", e);
        }
    });

    let feed = Arc::new(KubeFeed::new(client.clone()));
    let ctx = Arc::new(Context::new(client, Arc::new(nb), feed, config, metrics));

    // returns once a shutdown signal has been received
    controller::run(ctx).await;
    info!("Shutdown signal received, exiting...");

    Ok(())
}
