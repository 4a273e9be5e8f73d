//! Observability for list/watch sessions
//!
//! Provides:
//! - Prometheus collectors (list latency, watch events, restarts, folded items)
//! - Structured JSON logging with tracing
//!
//! Collectors are registered in the default registry; exposing them is left
//! to the embedding process.

use crate::aggregator::AggregateSnapshot;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for list call latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<TallyMetricsInner> = OnceLock::new();

struct TallyMetricsInner {
    list_latency_seconds: HistogramVec,
    list_errors: IntCounterVec,
    watch_events: IntCounterVec,
    watch_restarts: IntCounterVec,
    items_folded: IntCounterVec,
}

impl TallyMetricsInner {
    fn new() -> Self {
        Self {
            list_latency_seconds: register_histogram_vec!(
                "resource_tally_list_latency_seconds",
                "Time spent in list calls against the cluster API",
                &["kind"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register list_latency_seconds"),

            list_errors: register_int_counter_vec!(
                "resource_tally_list_errors_total",
                "Total number of failed list calls",
                &["kind"]
            )
            .expect("Failed to register list_errors"),

            watch_events: register_int_counter_vec!(
                "resource_tally_watch_events_total",
                "Total number of raw watch events received",
                &["kind", "type"]
            )
            .expect("Failed to register watch_events"),

            watch_restarts: register_int_counter_vec!(
                "resource_tally_watch_restarts_total",
                "Total number of watch streams reopened after expiry",
                &["kind"]
            )
            .expect("Failed to register watch_restarts"),

            items_folded: register_int_counter_vec!(
                "resource_tally_items_folded_total",
                "Total number of items folded into aggregate state",
                &["kind"]
            )
            .expect("Failed to register items_folded"),
        }
    }
}

/// Handle to the process-wide tally metrics
///
/// Multiple clones share the same underlying collectors.
#[derive(Clone)]
pub struct TallyMetrics {
    _private: (),
}

impl Default for TallyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TallyMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TallyMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TallyMetricsInner {
        GLOBAL_METRICS.get_or_init(TallyMetricsInner::new)
    }

    pub fn observe_list_latency(&self, kind: &str, duration_secs: f64) {
        self.inner()
            .list_latency_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    pub fn inc_list_errors(&self, kind: &str) {
        self.inner().list_errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_watch_event(&self, kind: &str, event_type: &str) {
        self.inner()
            .watch_events
            .with_label_values(&[kind, event_type])
            .inc();
    }

    pub fn inc_watch_restarts(&self, kind: &str) {
        self.inner().watch_restarts.with_label_values(&[kind]).inc();
    }

    pub fn inc_items_folded(&self, kind: &str) {
        self.inner().items_folded.with_label_values(&[kind]).inc();
    }

    /// Current restart count for a kind
    pub fn watch_restarts(&self, kind: &str) -> u64 {
        self.inner().watch_restarts.with_label_values(&[kind]).get()
    }
}

/// Structured logger for session events
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    /// Log session startup
    pub fn log_startup(&self, version: &str, mode: &str, kinds: &[String]) {
        info!(
            event = "tally_started",
            cluster = %self.cluster,
            version = %version,
            mode = %mode,
            kinds = ?kinds,
            "Resource tally started"
        );
    }

    /// Log a watch stream being reopened
    pub fn log_watch_restart(&self, kind: &str, restarts: u64) {
        info!(
            event = "watch_restarted",
            cluster = %self.cluster,
            kind = %kind,
            restarts = restarts,
            "Watch stream expired, reopening"
        );
    }

    /// Log a watch loop ending with an error
    pub fn log_watch_failure(&self, kind: &str, error: &str) {
        warn!(
            event = "watch_failed",
            cluster = %self.cluster,
            kind = %kind,
            error = %error,
            "Watch loop terminated"
        );
    }

    /// Log an aggregate snapshot
    pub fn log_snapshot(&self, snapshot: &AggregateSnapshot) {
        info!(
            event = "aggregate_snapshot",
            cluster = %self.cluster,
            totals = ?snapshot.totals,
            requested = ?snapshot.sums,
            containers = snapshot.containers,
            containers_without_requests = snapshot.no_request_containers,
            items = snapshot.items,
            taken_at = snapshot.taken_at,
            "Aggregate resource requests"
        );
    }

    /// Log shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "tally_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Resource tally shutting down"
        );
    }
}
