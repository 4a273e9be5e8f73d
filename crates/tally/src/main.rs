//! Resource Tally - cluster-wide container request totals
//!
//! Lists (or watches) the configured resource kinds and reports the summed
//! resource requests of their containers, with a flat estimate for
//! containers that declare none.

use anyhow::{Context, Result};
use std::sync::Arc;
use tally_lib::{snapshot_kinds, ProxyFactory, StructuredLogger, WatchSession};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cluster;
mod config;

use config::{RunMode, TallyConfig};

const TALLY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting resource-tally");

    let config = TallyConfig::load()?;
    info!(
        cluster = %config.cluster_name,
        mode = config.mode.as_str(),
        kinds = ?config.kinds,
        "Tally configured"
    );

    let logger = StructuredLogger::new(&config.cluster_name);
    logger.log_startup(TALLY_VERSION, config.mode.as_str(), &config.kinds);

    let cluster = cluster::KubeCluster::connect(config.server_timeout_secs).await?;
    let factory = config
        .custom_kinds
        .iter()
        .fold(ProxyFactory::builder(Arc::new(cluster)), |builder, (name, kind)| {
            builder.custom_kind(name.clone(), kind.clone())
        })
        .build();

    let aggregator_config = config.aggregator_config();
    let state = match config.mode {
        RunMode::Snapshot => snapshot_kinds(&factory, &config.kinds, &aggregator_config)
            .await
            .context("Snapshot failed")?,
        RunMode::Watch => {
            let (shutdown_tx, _) = broadcast::channel(1);
            spawn_signal_handler(shutdown_tx.clone(), logger.clone());

            let mut session = WatchSession::new(aggregator_config.clone())
                .watch_config(config.watch_config())
                .logger(logger.clone());
            if let Some(interval) = config.report_interval() {
                session = session.report_every(interval);
            }

            let outcome = session
                .run(&factory, &config.kinds, &shutdown_tx)
                .await
                .context("Watch session failed")?;
            for (kind, stats) in &outcome.stats {
                info!(
                    kind = %kind,
                    streams_opened = stats.streams_opened,
                    events = stats.events_forwarded,
                    restarts = stats.restarts,
                    "Watch loop finished"
                );
            }
            outcome.state
        }
    };

    let snapshot = state.snapshot(&aggregator_config);
    logger.log_snapshot(&snapshot);
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("Failed to encode snapshot")?
    );

    Ok(())
}

/// Broadcast shutdown on Ctrl-C
fn spawn_signal_handler(shutdown_tx: broadcast::Sender<()>, logger: StructuredLogger) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        logger.log_shutdown("SIGINT received");
        if shutdown_tx.send(()).is_err() {
            warn!("No watch loops left to stop");
        }
    });
}
