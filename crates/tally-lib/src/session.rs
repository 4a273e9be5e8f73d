//! Multi-kind sessions
//!
//! Each kind is listed or watched in its own task with its own aggregator
//! shard. Shards are merged into one [`AggregateState`] at the end.

use crate::aggregator::{AggregateSnapshot, AggregateState, Aggregator, AggregatorConfig};
use crate::error::{Error, Result};
use crate::factory::ProxyFactory;
use crate::observability::StructuredLogger;
use crate::watch::{WatchConfig, WatchLoop, WatchStats};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

type Shard = Arc<Mutex<Aggregator>>;

/// List every kind once and fold the results
///
/// Kinds are listed concurrently and a kind named twice is listed once.
/// The first failure aborts the remaining lists and is returned.
pub async fn snapshot_kinds(
    factory: &ProxyFactory,
    kinds: &[String],
    config: &AggregatorConfig,
) -> Result<AggregateState> {
    let kinds = distinct(kinds);
    let mut tasks = JoinSet::new();
    for kind in &kinds {
        let proxy = factory.get(kind)?;
        let config = config.clone();
        tasks.spawn(async move {
            let items = proxy.get_all().await?;
            let mut shard = Aggregator::new(config);
            shard.fold_items(&items)?;
            debug!(kind = %proxy.kind(), items = items.len(), "Folded list response");
            Ok::<_, Error>(shard.into_state())
        });
    }

    let mut merged = AggregateState::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(shard) => merged.merge(shard?),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => warn!(error = %e, "List task cancelled"),
        }
    }

    info!(kinds = kinds.len(), items = merged.items(), "Snapshot complete");
    Ok(merged)
}

/// Watch every kind until shutdown with default session settings
pub async fn watch_kinds(
    factory: &ProxyFactory,
    kinds: &[String],
    config: &AggregatorConfig,
    watch_config: &WatchConfig,
    shutdown: &broadcast::Sender<()>,
) -> Result<WatchOutcome> {
    WatchSession::new(config.clone())
        .watch_config(watch_config.clone())
        .run(factory, kinds, shutdown)
        .await
}

/// Merged result of a watch session
#[derive(Debug, Clone)]
pub struct WatchOutcome {
    pub state: AggregateState,
    /// Loop counters per kind
    pub stats: BTreeMap<String, WatchStats>,
}

/// Concurrent watch over several kinds
///
/// ```ignore
/// let outcome = WatchSession::new(config)
///     .report_every(Duration::from_secs(60))
///     .logger(logger)
///     .run(&factory, &kinds, &shutdown_tx)
///     .await?;
/// ```
pub struct WatchSession {
    config: AggregatorConfig,
    watch_config: WatchConfig,
    report_interval: Option<Duration>,
    logger: Option<StructuredLogger>,
}

impl WatchSession {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            watch_config: WatchConfig::default(),
            report_interval: None,
            logger: None,
        }
    }

    pub fn watch_config(mut self, watch_config: WatchConfig) -> Self {
        self.watch_config = watch_config;
        self
    }

    /// Log a merged snapshot at this interval while the loops run
    pub fn report_every(mut self, interval: Duration) -> Self {
        self.report_interval = Some(interval);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Run one watch loop per kind until `shutdown` fires or a loop fails
    ///
    /// A failing loop stops its siblings through the same shutdown channel,
    /// and its error is returned once they have all exited.
    pub async fn run(
        &self,
        factory: &ProxyFactory,
        kinds: &[String],
        shutdown: &broadcast::Sender<()>,
    ) -> Result<WatchOutcome> {
        let proxies = distinct(kinds)
            .into_iter()
            .map(|kind| factory.get(kind))
            .collect::<Result<Vec<_>>>()?;

        let mut shards: Vec<Shard> = Vec::with_capacity(proxies.len());
        let mut tasks = JoinSet::new();
        for proxy in proxies {
            let shard: Shard = Arc::new(Mutex::new(Aggregator::new(self.config.clone())));
            let mut watch_loop =
                WatchLoop::new(proxy.clone(), shard.clone(), self.watch_config.clone());
            if let Some(logger) = &self.logger {
                watch_loop = watch_loop.with_logger(logger.clone());
            }
            let receiver = shutdown.subscribe();
            let kind = proxy.kind().to_string();
            tasks.spawn(async move { (kind, watch_loop.run(receiver).await) });
            shards.push(shard);
        }

        let mut ticker = self.report_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        let mut stats = BTreeMap::new();
        let mut failure: Option<Error> = None;

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((kind, Ok((_, loop_stats)))) => {
                            stats.insert(kind, loop_stats);
                        }
                        Ok((kind, Err(e))) => {
                            if failure.is_none() {
                                warn!(kind = %kind, error = %e, "Watch loop failed, stopping remaining loops");
                                // receivers of loops that already exited are gone
                                let _ = shutdown.send(());
                                failure = Some(e);
                            }
                        }
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(e) => warn!(error = %e, "Watch task cancelled"),
                    }
                }
                _ = next_tick(&mut ticker) => {
                    let snapshot = merge_shards(&shards).await.snapshot(&self.config);
                    self.report(&snapshot);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        Ok(WatchOutcome {
            state: merge_shards(&shards).await,
            stats,
        })
    }

    fn report(&self, snapshot: &AggregateSnapshot) {
        match &self.logger {
            Some(logger) => logger.log_snapshot(snapshot),
            None => info!(totals = ?snapshot.totals, items = snapshot.items, "Aggregate resource requests"),
        }
    }
}

/// Drop repeated kind names, keeping first-seen order
fn distinct(kinds: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    kinds
        .iter()
        .filter(|kind| {
            let first = seen.insert(kind.as_str());
            if !first {
                warn!(kind = %kind, "Kind requested more than once, ignoring repeat");
            }
            first
        })
        .map(String::as_str)
        .collect()
}

async fn merge_shards(shards: &[Shard]) -> AggregateState {
    let mut merged = AggregateState::default();
    for shard in shards {
        merged.merge(shard.lock().await.state().clone());
    }
    merged
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
