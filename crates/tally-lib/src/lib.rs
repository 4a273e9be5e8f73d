//! Cluster resource aggregation core
//!
//! This crate provides the building blocks for:
//! - Parsing resource quantities ("100m", "2Gi")
//! - Listing and watching arbitrary cluster resource kinds
//! - Restarting watch streams when the server expires them
//! - Folding container resource requests into aggregate sums

pub mod aggregator;
pub mod error;
pub mod factory;
pub mod item;
pub mod observability;
pub mod proxy;
pub mod quantity;
pub mod session;
pub mod watch;

#[cfg(test)]
mod testing;

pub use aggregator::{
    AggregateSnapshot, AggregateState, AggregationMode, Aggregator, AggregatorConfig,
};
pub use error::{Error, Result};
pub use factory::{CustomKind, KindDescriptor, ProxyFactory, ProxyFactoryBuilder};
pub use item::{Container, ResourceItem, Value, WatchEvent};
pub use observability::{StructuredLogger, TallyMetrics};
pub use proxy::{
    ApiEndpoint, BuiltinProxy, ClusterApi, CustomProxy, RawEventStream, RawWatchEvent,
    ResourceProxy, ResourceWatch,
};
pub use quantity::{parse_quantity, suffixes_for, Quantity, CPU_SUFFIXES, MEMORY_SUFFIXES};
pub use session::{snapshot_kinds, watch_kinds, WatchOutcome, WatchSession};
pub use watch::{EventSink, WatchConfig, WatchLoop, WatchStats};
