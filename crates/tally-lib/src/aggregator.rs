//! Folding container resource requests into aggregate sums
//!
//! Two modes:
//! - `Snapshot`: every folded item adds to the sums; meant for one list pass
//! - `Stateful`: contributions are tracked per item identity so modified
//!   items replace their previous contribution and deleted items remove it
//!
//! A reopened watch replays only objects that still exist, so stateful
//! aggregators drop a kind's tracked contributions when its stream restarts
//! (see [`Aggregator::forget_kind`]).
//!
//! Containers without requests contribute nothing to the sums but are
//! counted; the reported totals add a flat per-container estimate for them.

use crate::error::Result;
use crate::item::{ResourceItem, WatchEvent};
use crate::observability::TallyMetrics;
use crate::quantity::{parse_quantity, suffixes_for};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// How events are folded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// Additive only; no per-item bookkeeping
    #[default]
    Snapshot,
    /// Per-item contributions; modifications replace, deletions reverse
    Stateful,
}

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Request keys to sum (e.g. "cpu", "memory")
    pub metrics: Vec<String>,
    pub mode: AggregationMode,
    /// Estimate added per container without requests, by metric key
    pub no_request_estimate: BTreeMap<String, f64>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            metrics: vec!["cpu".to_string()],
            mode: AggregationMode::Snapshot,
            no_request_estimate: BTreeMap::from([("cpu".to_string(), 0.1)]),
        }
    }
}

impl AggregatorConfig {
    pub fn with_mode(mut self, mode: AggregationMode) -> Self {
        self.mode = mode;
        self
    }
}

/// What one item added to the state
#[derive(Debug, Clone, Default, PartialEq)]
struct Contribution {
    kind: String,
    sums: BTreeMap<String, f64>,
    containers: u64,
    no_request: u64,
}

/// Running sums for one aggregation run
///
/// Owned by a single loop. Shards from parallel loops are combined with
/// [`AggregateState::merge`].
#[derive(Debug, Clone, Default)]
pub struct AggregateState {
    sums: BTreeMap<String, f64>,
    no_request_containers: u64,
    containers: u64,
    items: u64,
    contributions: HashMap<String, Contribution>,
}

impl AggregateState {
    /// Requested sum for a metric, without the no-request estimate
    pub fn sum(&self, metric: &str) -> f64 {
        self.sums.get(metric).copied().unwrap_or(0.0)
    }

    pub fn sums(&self) -> &BTreeMap<String, f64> {
        &self.sums
    }

    pub fn no_request_containers(&self) -> u64 {
        self.no_request_containers
    }

    pub fn containers(&self) -> u64 {
        self.containers
    }

    pub fn items(&self) -> u64 {
        self.items
    }

    /// Number of items with a tracked contribution (stateful mode)
    pub fn tracked_items(&self) -> usize {
        self.contributions.len()
    }

    fn apply(&mut self, contribution: &Contribution) {
        for (metric, value) in &contribution.sums {
            *self.sums.entry(metric.clone()).or_insert(0.0) += value;
        }
        self.containers += contribution.containers;
        self.no_request_containers += contribution.no_request;
        self.items += 1;
    }

    fn revert(&mut self, contribution: &Contribution) {
        for (metric, value) in &contribution.sums {
            if let Some(sum) = self.sums.get_mut(metric) {
                *sum = (*sum - value).max(0.0);
            }
        }
        self.containers = self.containers.saturating_sub(contribution.containers);
        self.no_request_containers = self
            .no_request_containers
            .saturating_sub(contribution.no_request);
        self.items = self.items.saturating_sub(1);
    }

    /// Revert and forget every tracked contribution of one kind
    fn forget_kind(&mut self, kind: &str) -> usize {
        let stale: Vec<String> = self
            .contributions
            .iter()
            .filter(|(_, contribution)| contribution.kind == kind)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(contribution) = self.contributions.remove(key) {
                self.revert(&contribution);
            }
        }
        stale.len()
    }

    /// Combine another shard into this one
    pub fn merge(&mut self, other: AggregateState) {
        for (metric, value) in other.sums {
            *self.sums.entry(metric).or_insert(0.0) += value;
        }
        self.no_request_containers += other.no_request_containers;
        self.containers += other.containers;
        self.items += other.items;
        self.contributions.extend(other.contributions);
    }

    /// Clear everything, including tracked contributions
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Read-only view with the no-request estimate applied
    pub fn snapshot(&self, config: &AggregatorConfig) -> AggregateSnapshot {
        let mut totals: BTreeMap<String, f64> = config
            .metrics
            .iter()
            .chain(self.sums.keys())
            .chain(config.no_request_estimate.keys())
            .map(|metric| (metric.clone(), self.sum(metric)))
            .collect();

        for (metric, estimate) in &config.no_request_estimate {
            if let Some(total) = totals.get_mut(metric) {
                *total += self.no_request_containers as f64 * estimate;
            }
        }

        AggregateSnapshot {
            sums: self.sums.clone(),
            totals,
            no_request_containers: self.no_request_containers,
            containers: self.containers,
            items: self.items,
            taken_at: Utc::now().timestamp(),
        }
    }
}

/// Reportable view of an [`AggregateState`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    /// Requested sums per metric
    pub sums: BTreeMap<String, f64>,
    /// Sums plus the per-container estimate for containers without requests
    pub totals: BTreeMap<String, f64>,
    pub no_request_containers: u64,
    pub containers: u64,
    pub items: u64,
    /// Unix timestamp (seconds)
    pub taken_at: i64,
}

impl AggregateSnapshot {
    pub fn total(&self, metric: &str) -> f64 {
        self.totals.get(metric).copied().unwrap_or(0.0)
    }
}

/// Folds items and events into an owned [`AggregateState`]
pub struct Aggregator {
    config: AggregatorConfig,
    state: AggregateState,
    metrics: TallyMetrics,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            state: AggregateState::default(),
            metrics: TallyMetrics::new(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn state(&self) -> &AggregateState {
        &self.state
    }

    pub fn into_state(self) -> AggregateState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state.reset();
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        self.state.snapshot(&self.config)
    }

    /// Add one item's requests to the sums
    ///
    /// Quantities are parsed before anything is applied; on error the state
    /// is unchanged.
    pub fn fold_item(&mut self, item: &ResourceItem) -> Result<()> {
        let contribution = self.contribution(item)?;
        self.state.apply(&contribution);
        self.metrics.inc_items_folded(item.kind());
        Ok(())
    }

    /// Fold every item of a list response
    pub fn fold_items<'a, I>(&mut self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a ResourceItem>,
    {
        items.into_iter().try_for_each(|item| self.fold_item(item))
    }

    /// Drop everything tracked for one kind before its watch replays
    ///
    /// Objects deleted while the stream was down never produce a deletion;
    /// forgetting the kind lets the replay rebuild only what still exists.
    /// Snapshot mode tracks nothing, so this is a no-op there.
    pub fn forget_kind(&mut self, kind: &str) -> usize {
        let dropped = self.state.forget_kind(kind);
        if dropped > 0 {
            debug!(kind = %kind, dropped, "Dropped tracked contributions before replay");
        }
        dropped
    }

    /// Fold a classified watch event according to the configured mode
    pub fn fold_event(&mut self, event: &WatchEvent) -> Result<()> {
        match (self.config.mode, event) {
            (AggregationMode::Snapshot, WatchEvent::Added(item) | WatchEvent::Modified(item)) => {
                self.fold_item(item)
            }
            (AggregationMode::Snapshot, WatchEvent::Deleted(item)) => {
                debug!(item = %item.key(), "Ignoring deletion in snapshot mode");
                Ok(())
            }
            (AggregationMode::Stateful, WatchEvent::Added(item) | WatchEvent::Modified(item)) => {
                let contribution = self.contribution(item)?;
                let key = item.key();
                if let Some(previous) = self.state.contributions.remove(&key) {
                    self.state.revert(&previous);
                }
                self.state.apply(&contribution);
                self.state.contributions.insert(key, contribution);
                self.metrics.inc_items_folded(item.kind());
                Ok(())
            }
            (AggregationMode::Stateful, WatchEvent::Deleted(item)) => {
                let key = item.key();
                match self.state.contributions.remove(&key) {
                    Some(previous) => self.state.revert(&previous),
                    None => debug!(item = %key, "Deletion for untracked item"),
                }
                Ok(())
            }
        }
    }

    fn contribution(&self, item: &ResourceItem) -> Result<Contribution> {
        let mut contribution = Contribution {
            kind: item.kind().to_string(),
            ..Contribution::default()
        };

        for container in item.containers() {
            contribution.containers += 1;

            let Some(requests) = container.requests() else {
                contribution.no_request += 1;
                debug!(
                    item = %item.key(),
                    container = %container.name,
                    "Container declares no resource requests"
                );
                continue;
            };

            for metric in &self.config.metrics {
                if let Some(raw) = requests.get(metric) {
                    let quantity = parse_quantity(raw, suffixes_for(metric))?;
                    *contribution.sums.entry(metric.clone()).or_insert(0.0) += quantity.value();
                }
            }
        }

        Ok(contribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::item::{Container, ResourceRequirements, Value};
    use std::collections::BTreeMap;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn container(requests: &[(&str, &str)]) -> Container {
        let requests = if requests.is_empty() {
            None
        } else {
            Some(
                requests
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            )
        };
        Container {
            name: "c".to_string(),
            resources: ResourceRequirements {
                requests,
                limits: None,
            },
        }
    }

    fn item(name: &str, containers: Vec<Container>) -> ResourceItem {
        let object = Value::Map(BTreeMap::from([(
            "metadata".to_string(),
            Value::Map(BTreeMap::from([(
                "name".to_string(),
                Value::String(name.to_string()),
            )])),
        )]));
        ResourceItem::new("pod", object, containers)
    }

    fn scenario() -> Vec<ResourceItem> {
        vec![
            item("a", vec![container(&[("cpu", "100m")])]),
            item("b", vec![container(&[])]),
            item("c", vec![container(&[("cpu", "1")])]),
        ]
    }

    #[test]
    fn test_snapshot_sum_with_no_request_estimate() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        aggregator.fold_items(&scenario()).unwrap();

        let snapshot = aggregator.snapshot();
        assert!(approx(snapshot.total("cpu"), 1.2), "{}", snapshot.total("cpu"));
        assert!(approx(aggregator.state().sum("cpu"), 1.1));
        assert_eq!(snapshot.no_request_containers, 1);
        assert_eq!(snapshot.containers, 3);
        assert_eq!(snapshot.items, 3);
    }

    #[test]
    fn test_snapshot_mode_does_not_deduplicate() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        let items = scenario();
        aggregator.fold_items(&items).unwrap();
        aggregator.fold_items(&items).unwrap();

        assert!(approx(aggregator.snapshot().total("cpu"), 2.4));
        assert_eq!(aggregator.state().no_request_containers(), 2);

        aggregator.reset();
        aggregator.fold_items(&items).unwrap();
        assert!(approx(aggregator.snapshot().total("cpu"), 1.2));
    }

    #[test]
    fn test_multiple_metrics() {
        let config = AggregatorConfig {
            metrics: vec!["cpu".to_string(), "memory".to_string()],
            ..AggregatorConfig::default()
        };
        let mut aggregator = Aggregator::new(config);
        aggregator
            .fold_item(&item(
                "a",
                vec![
                    container(&[("cpu", "500m"), ("memory", "1Gi")]),
                    container(&[("memory", "512Mi")]),
                    container(&[("ephemeral-storage", "1G")]),
                ],
            ))
            .unwrap();

        let snapshot = aggregator.snapshot();
        assert!(approx(snapshot.total("cpu"), 0.5));
        assert!(approx(snapshot.total("memory"), 1_610_612_736.0));
        assert_eq!(snapshot.no_request_containers, 0);
        assert!(!snapshot.sums.contains_key("ephemeral-storage"));
    }

    #[test]
    fn test_invalid_quantity_leaves_state_untouched() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        let bad = item(
            "bad",
            vec![container(&[("cpu", "1")]), container(&[("cpu", "12x9")])],
        );

        let err = aggregator.fold_item(&bad).unwrap_err();

        assert!(matches!(err, Error::InvalidQuantity { ref input, .. } if input == "12x9"));
        assert_eq!(aggregator.state().sum("cpu"), 0.0);
        assert_eq!(aggregator.state().containers(), 0);
    }

    #[test]
    fn test_snapshot_mode_ignores_deletions() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        let pod = item("a", vec![container(&[("cpu", "1")])]);

        aggregator.fold_event(&WatchEvent::Added(pod.clone())).unwrap();
        aggregator.fold_event(&WatchEvent::Modified(pod.clone())).unwrap();
        aggregator.fold_event(&WatchEvent::Deleted(pod)).unwrap();

        assert!(approx(aggregator.state().sum("cpu"), 2.0));
        assert_eq!(aggregator.state().tracked_items(), 0);
    }

    #[test]
    fn test_stateful_mode_replaces_and_reverses() {
        let config = AggregatorConfig::default().with_mode(AggregationMode::Stateful);
        let mut aggregator = Aggregator::new(config);

        aggregator
            .fold_event(&WatchEvent::Added(item("a", vec![container(&[("cpu", "1")])])))
            .unwrap();
        aggregator
            .fold_event(&WatchEvent::Added(item("b", vec![container(&[])])))
            .unwrap();
        aggregator
            .fold_event(&WatchEvent::Modified(item(
                "a",
                vec![container(&[("cpu", "250m")])],
            )))
            .unwrap();

        assert!(approx(aggregator.state().sum("cpu"), 0.25));
        assert_eq!(aggregator.state().items(), 2);
        assert!(approx(aggregator.snapshot().total("cpu"), 0.35));

        aggregator
            .fold_event(&WatchEvent::Deleted(item("b", vec![container(&[])])))
            .unwrap();
        assert_eq!(aggregator.state().no_request_containers(), 0);
        assert_eq!(aggregator.state().tracked_items(), 1);

        // unknown deletions are ignored
        aggregator
            .fold_event(&WatchEvent::Deleted(item("zzz", vec![container(&[("cpu", "4")])])))
            .unwrap();
        assert!(approx(aggregator.state().sum("cpu"), 0.25));
    }

    #[test]
    fn test_stateful_replay_is_idempotent() {
        let config = AggregatorConfig::default().with_mode(AggregationMode::Stateful);
        let mut aggregator = Aggregator::new(config);

        for _ in 0..3 {
            for pod in scenario() {
                aggregator.fold_event(&WatchEvent::Added(pod)).unwrap();
            }
        }

        assert!(approx(aggregator.snapshot().total("cpu"), 1.2));
        assert_eq!(aggregator.state().tracked_items(), 3);
    }

    #[test]
    fn test_forget_kind_reverts_only_that_kind() {
        let config = AggregatorConfig::default().with_mode(AggregationMode::Stateful);
        let mut aggregator = Aggregator::new(config);
        for pod in scenario() {
            aggregator.fold_event(&WatchEvent::Added(pod)).unwrap();
        }
        let job = ResourceItem::new(
            "job",
            Value::Map(BTreeMap::new()),
            vec![container(&[("cpu", "2")])],
        );
        aggregator.fold_event(&WatchEvent::Added(job)).unwrap();

        assert_eq!(aggregator.forget_kind("pod"), 3);

        assert!(approx(aggregator.state().sum("cpu"), 2.0));
        assert_eq!(aggregator.state().no_request_containers(), 0);
        assert_eq!(aggregator.state().items(), 1);
        assert_eq!(aggregator.state().tracked_items(), 1);

        // replaying the pods after forgetting counts them once
        for pod in scenario() {
            aggregator.fold_event(&WatchEvent::Added(pod)).unwrap();
        }
        assert!(approx(aggregator.snapshot().total("cpu"), 3.2));
    }

    #[test]
    fn test_forget_kind_is_noop_in_snapshot_mode() {
        let mut aggregator = Aggregator::new(AggregatorConfig::default());
        aggregator.fold_items(&scenario()).unwrap();

        assert_eq!(aggregator.forget_kind("pod"), 0);
        assert!(approx(aggregator.snapshot().total("cpu"), 1.2));
    }

    #[test]
    fn test_merge_shards() {
        let mut first = Aggregator::new(AggregatorConfig::default());
        first.fold_items(&scenario()[..2]).unwrap();
        let mut second = Aggregator::new(AggregatorConfig::default());
        second.fold_items(&scenario()[2..]).unwrap();

        let mut merged = first.into_state();
        merged.merge(second.into_state());

        let snapshot = merged.snapshot(&AggregatorConfig::default());
        assert!(approx(snapshot.total("cpu"), 1.2));
        assert_eq!(snapshot.items, 3);
    }

    #[test]
    fn test_estimate_applies_only_to_configured_metrics() {
        let mut aggregator = Aggregator::new(AggregatorConfig {
            metrics: vec!["cpu".to_string(), "memory".to_string()],
            ..AggregatorConfig::default()
        });
        aggregator.fold_item(&item("a", vec![container(&[])])).unwrap();

        let snapshot = aggregator.snapshot();
        assert!(approx(snapshot.total("cpu"), 0.1));
        assert_eq!(snapshot.total("memory"), 0.0);
        assert!(snapshot.totals.contains_key("memory"));
    }
}
