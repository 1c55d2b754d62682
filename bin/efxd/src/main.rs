//! ---
//! efx_section: "01-core-functionality"
//! efx_subsection: "binary"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Binary entrypoint for the EcoFlow exporter daemon."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use efx_api::{create_client, TransportMetrics};
use efx_collector::CollectionLoop;
use efx_common::config::{ConfigError, ExporterConfig};
use efx_common::logging::init_tracing;
use efx_devices::DeviceResolver;
use efx_metrics::{new_registry, spawn_http_server, ExporterMetrics, MetricsPool};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "EcoFlow telemetry exporter daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/exporter.toml"));
    candidates.push(PathBuf::from("/etc/ecoflow-exporter/exporter.toml"));

    let (config, config_source) = match ExporterConfig::load_with_source(&candidates) {
        Ok(loaded) => (loaded.config, Some(loaded.source)),
        // Container deployments configure everything through the
        // environment and ship no file at all.
        Err(ConfigError::NotFound(_)) => {
            let mut config = ExporterConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            (config, None)
        }
        Err(err) => return Err(err.into()),
    };

    init_tracing("efxd", &config.logging)?;
    match &config_source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found, using environment variables"),
    }

    let device_sn = config.device_sn()?.to_owned();
    let resolver = DeviceResolver::from_config(&config.devices)
        .context("failed to load the device table")?;

    let registry = new_registry();
    let pool = MetricsPool::new(registry.clone());
    let metrics = ExporterMetrics::new(&registry, &config.exporter.metric_prefix)
        .context("failed to register exporter metrics")?;
    let analytics = TransportMetrics::new(&config.exporter.metric_prefix)
        .context("failed to create transport metrics")?;
    analytics
        .register(&registry)
        .context("failed to register transport metrics")?;
    let metrics_server = spawn_http_server(registry, config.exporter.listen)?;

    let client =
        create_client(&config, analytics).context("failed to construct the transport")?;
    let collector = CollectionLoop::new(
        client,
        device_sn,
        resolver,
        pool,
        metrics,
        config.exporter.metric_prefix.clone(),
        config.timing.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received; shutting down");
        let _ = shutdown_tx.send(true);
    });

    let result = collector
        .run(shutdown_rx)
        .await
        .context("collection loop failed");

    if let Err(err) = metrics_server.shutdown().await {
        warn!(error = %err, "metrics server shutdown failed");
    }

    result
}
