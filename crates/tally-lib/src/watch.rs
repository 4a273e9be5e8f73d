//! Watch loop
//!
//! Drives one proxy's watch stream until cancelled. The loop is a two-state
//! machine:
//! - `Streaming`: pull the next event and hand it to the sink
//! - `Restarting`: the stream ended (expiry, server close, idle timeout);
//!   reopen it, let the sink resync, and go back to `Streaming`
//!
//! Watch errors, unknown event types, transport failures and sink errors end
//! the loop with that error. They are never retried here.

use crate::aggregator::Aggregator;
use crate::error::{Error, Result};
use crate::item::WatchEvent;
use crate::observability::{StructuredLogger, TallyMetrics};
use crate::proxy::{ResourceProxy, ResourceWatch};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// Configuration for a watch loop
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Longest wait for a single event before the stream is treated as expired
    pub idle_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Consumer of classified watch events
#[async_trait]
pub trait EventSink: Send {
    async fn handle(&mut self, event: WatchEvent) -> Result<()>;

    /// Called after a restarted stream opens, before any replayed event
    ///
    /// The replay re-announces every object that still exists; objects
    /// deleted while the stream was down are simply absent from it.
    async fn resync(&mut self, _kind: &str) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl EventSink for Aggregator {
    async fn handle(&mut self, event: WatchEvent) -> Result<()> {
        self.fold_event(&event)
    }

    async fn resync(&mut self, kind: &str) -> Result<()> {
        self.forget_kind(kind);
        Ok(())
    }
}

/// Aggregator shared with a reporter that reads it while the loop runs
#[async_trait]
impl EventSink for Arc<Mutex<Aggregator>> {
    async fn handle(&mut self, event: WatchEvent) -> Result<()> {
        self.lock().await.fold_event(&event)
    }

    async fn resync(&mut self, kind: &str) -> Result<()> {
        self.lock().await.forget_kind(kind);
        Ok(())
    }
}

/// Forwards events as-is; the receiver sees the replay after a restart
#[async_trait]
impl EventSink for mpsc::Sender<WatchEvent> {
    async fn handle(&mut self, event: WatchEvent) -> Result<()> {
        let kind = event.kind().to_string();
        self.send(event)
            .await
            .map_err(|_| Error::ConsumerClosed { kind })
    }
}

/// Counters for one loop run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub streams_opened: u64,
    pub events_forwarded: u64,
    pub restarts: u64,
}

enum LoopState {
    Streaming(ResourceWatch),
    Restarting,
}

/// Watch loop over one resource proxy
pub struct WatchLoop<S> {
    proxy: Arc<dyn ResourceProxy>,
    sink: S,
    config: WatchConfig,
    stats: WatchStats,
    logger: Option<StructuredLogger>,
    metrics: TallyMetrics,
}

impl<S: EventSink> WatchLoop<S> {
    pub fn new(proxy: Arc<dyn ResourceProxy>, sink: S, config: WatchConfig) -> Self {
        Self {
            proxy,
            sink,
            config,
            stats: WatchStats::default(),
            logger: None,
            metrics: TallyMetrics::new(),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Run until shutdown is signalled or a fatal error occurs
    ///
    /// On shutdown the sink is handed back together with the loop counters.
    /// Dropping the current stream closes the underlying connection.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(S, WatchStats)> {
        let kind = self.proxy.kind().to_string();
        info!(
            kind = %kind,
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Starting watch loop"
        );

        let mut state = match self.open(&kind, &mut shutdown).await? {
            Some(watch) => LoopState::Streaming(watch),
            None => return Ok((self.sink, self.stats)),
        };

        loop {
            state = match state {
                LoopState::Streaming(mut watch) => {
                    let next = tokio::select! {
                        next = watch.next() => next,
                        _ = shutdown.recv() => {
                            info!(kind = %kind, "Shutting down watch loop");
                            return Ok((self.sink, self.stats));
                        }
                    };

                    match next {
                        Some(Ok(event)) => {
                            debug!(kind = %kind, event = %event, "Forwarding watch event");
                            if let Err(e) = self.sink.handle(event).await {
                                return Err(self.fail(&kind, e));
                            }
                            self.stats.events_forwarded += 1;
                            LoopState::Streaming(watch)
                        }
                        Some(Err(e)) => return Err(self.fail(&kind, e)),
                        None => LoopState::Restarting,
                    }
                }
                LoopState::Restarting => {
                    self.stats.restarts += 1;
                    self.metrics.inc_watch_restarts(&kind);
                    match &self.logger {
                        Some(logger) => logger.log_watch_restart(&kind, self.stats.restarts),
                        None => debug!(kind = %kind, "Restarting watch"),
                    }

                    let Some(watch) = self.open(&kind, &mut shutdown).await? else {
                        return Ok((self.sink, self.stats));
                    };
                    if let Err(e) = self.sink.resync(&kind).await {
                        return Err(self.fail(&kind, e));
                    }
                    LoopState::Streaming(watch)
                }
            };
        }
    }

    /// Open a stream; `None` when shutdown arrives first
    async fn open(
        &mut self,
        kind: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Option<ResourceWatch>> {
        let opened = tokio::select! {
            opened = self.proxy.watch() => opened,
            _ = shutdown.recv() => {
                info!(kind = %kind, "Shutting down watch loop");
                return Ok(None);
            }
        };

        match opened {
            Ok(watch) => {
                self.stats.streams_opened += 1;
                Ok(Some(watch.with_idle_timeout(self.config.idle_timeout)))
            }
            Err(e) => Err(self.fail(kind, e)),
        }
    }

    fn fail(&self, kind: &str, error: Error) -> Error {
        match &self.logger {
            Some(logger) => logger.log_watch_failure(kind, &error.to_string()),
            None => warn!(kind = %kind, error = %error, "Watch loop terminated"),
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregationMode, AggregatorConfig};
    use crate::factory::ProxyFactory;
    use crate::proxy::RawWatchEvent;
    use crate::testing::{added, error_event, expired, pod, ScriptedCluster};

    fn pod_proxy(cluster: Arc<ScriptedCluster>) -> Arc<dyn ResourceProxy> {
        ProxyFactory::builder(cluster).build().get("pod").unwrap()
    }

    #[tokio::test]
    async fn test_restarts_after_expiry() {
        let cluster = Arc::new(
            ScriptedCluster::with_streams(vec![
                vec![added("a"), RawWatchEvent::new("MODIFIED", pod("a", Some("200m"))), expired()],
                vec![added("b")],
            ])
            .hang_after_script(),
        );
        let (event_tx, mut event_rx) = mpsc::channel::<WatchEvent>(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let watch_loop = WatchLoop::new(pod_proxy(cluster.clone()), event_tx, WatchConfig::default());
        let handle = tokio::spawn(watch_loop.run(shutdown_rx));

        let mut types = Vec::new();
        for _ in 0..3 {
            types.push(event_rx.recv().await.unwrap().event_type());
        }
        shutdown_tx.send(()).unwrap();
        let (_, stats) = handle.await.unwrap().unwrap();

        assert_eq!(types, vec!["ADDED", "MODIFIED", "ADDED"]);
        assert_eq!(cluster.watch_calls(), 2);
        assert_eq!(stats.events_forwarded, 3);
        assert_eq!(stats.streams_opened, 2);
        assert_eq!(stats.restarts, 1);
    }

    #[tokio::test]
    async fn test_watch_error_is_fatal() {
        let cluster = Arc::new(ScriptedCluster::with_streams(vec![
            vec![added("a"), error_event("boom")],
            vec![added("b")],
        ]));
        let (event_tx, mut event_rx) = mpsc::channel::<WatchEvent>(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let result = WatchLoop::new(pod_proxy(cluster.clone()), event_tx, WatchConfig::default())
            .run(shutdown_rx)
            .await;

        let err = result.err().unwrap();
        assert!(matches!(err, Error::Watch { ref reason, .. } if reason == "boom"));
        assert_eq!(cluster.watch_calls(), 1);
        assert!(event_rx.recv().await.is_some());
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_is_fatal() {
        let cluster = Arc::new(ScriptedCluster::with_streams(vec![vec![RawWatchEvent::new(
            "SURPRISE",
            serde_json::json!({}),
        )]]));
        let (event_tx, _event_rx) = mpsc::channel::<WatchEvent>(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let err = WatchLoop::new(pod_proxy(cluster.clone()), event_tx, WatchConfig::default())
            .run(shutdown_rx)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::UnknownEvent { .. }));
        assert_eq!(cluster.watch_calls(), 1);
    }

    #[tokio::test]
    async fn test_sink_error_is_fatal() {
        let cluster = Arc::new(ScriptedCluster::with_streams(vec![vec![RawWatchEvent::new(
            "ADDED",
            pod("bad", Some("lots")),
        )]]));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let aggregator = Aggregator::new(AggregatorConfig::default());

        let err = WatchLoop::new(pod_proxy(cluster), aggregator, WatchConfig::default())
            .run(shutdown_rx)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::InvalidQuantity { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_aggregated_state() {
        let cluster = Arc::new(
            ScriptedCluster::with_streams(vec![vec![
                added("a"),
                added("b"),
                RawWatchEvent::new("DELETED", pod("a", Some("100m"))),
                RawWatchEvent::new("ADDED", pod("c", None)),
            ]])
            .hang_after_script(),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let config = AggregatorConfig::default().with_mode(AggregationMode::Stateful);
        let watch_loop = WatchLoop::new(
            pod_proxy(cluster.clone()),
            Aggregator::new(config),
            WatchConfig::default(),
        )
        .with_logger(StructuredLogger::new("test"));
        let handle = tokio::spawn(watch_loop.run(shutdown_rx));

        // with time paused, the sleep only completes once the loop is parked on the silent stream
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        let (aggregator, stats) = handle.await.unwrap().unwrap();
        assert_eq!(cluster.watch_calls(), 1);
        assert_eq!(stats.events_forwarded, 4);
        let snapshot = aggregator.snapshot();
        assert!((snapshot.total("cpu") - 0.2).abs() < 1e-9);
        assert_eq!(snapshot.no_request_containers, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_restarts_stream() {
        let cluster = Arc::new(
            ScriptedCluster::with_streams(vec![vec![added("a")], vec![added("b")]])
                .hang_after_script(),
        );
        let (event_tx, mut event_rx) = mpsc::channel::<WatchEvent>(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let config = WatchConfig {
            idle_timeout: Duration::from_secs(300),
        };

        let handle = tokio::spawn(WatchLoop::new(pod_proxy(cluster.clone()), event_tx, config).run(shutdown_rx));

        assert_eq!(event_rx.recv().await.unwrap().item().name(), Some("a"));
        assert_eq!(event_rx.recv().await.unwrap().item().name(), Some("b"));
        shutdown_tx.send(()).unwrap();

        let (_, stats) = handle.await.unwrap().unwrap();
        assert_eq!(stats.restarts, 1);
        assert_eq!(cluster.watch_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_drops_objects_missing_from_replay() {
        let cluster = Arc::new(
            ScriptedCluster::with_streams(vec![
                vec![added("a"), added("b"), expired()],
                vec![added("a")],
            ])
            .hang_after_script(),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let config = AggregatorConfig::default().with_mode(AggregationMode::Stateful);
        let handle = tokio::spawn(
            WatchLoop::new(pod_proxy(cluster.clone()), Aggregator::new(config), WatchConfig::default())
                .run(shutdown_rx),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        let (aggregator, stats) = handle.await.unwrap().unwrap();
        assert_eq!(stats.restarts, 1);
        assert_eq!(cluster.watch_calls(), 2);
        assert!((aggregator.state().sum("cpu") - 0.1).abs() < 1e-9);
        assert_eq!(aggregator.state().tracked_items(), 1);
        assert_eq!(aggregator.state().items(), 1);
    }

    #[tokio::test]
    async fn test_closed_consumer_ends_loop() {
        let cluster = Arc::new(
            ScriptedCluster::with_streams(vec![vec![added("a"), added("b")]]).hang_after_script(),
        );
        let (event_tx, event_rx) = mpsc::channel::<WatchEvent>(16);
        drop(event_rx);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let err = WatchLoop::new(pod_proxy(cluster.clone()), event_tx, WatchConfig::default())
            .run(shutdown_rx)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::ConsumerClosed { ref kind } if kind == "pod"));
        assert_eq!(cluster.watch_calls(), 1);
    }
}
