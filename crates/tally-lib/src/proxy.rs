//! Uniform list/watch access to one resource kind
//!
//! [`ClusterApi`] is the seam to the API server: it returns raw list
//! documents and raw `{type, object}` event streams. Proxies turn those into
//! [`ResourceItem`]s and classified [`WatchEvent`]s, hiding whether the kind
//! is built-in (known schema) or custom (generic tree).

use crate::error::{Error, Result};
use crate::factory::{CustomKind, KindDescriptor};
use crate::item::{ResourceItem, WatchEvent};
use crate::observability::TallyMetrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// HTTP status the server uses for "resource version too old"
const EXPIRED_STATUS: i64 = 410;

/// Coordinates of a collection on the API server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiEndpoint {
    /// API group; empty for the core group
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: String,
}

impl ApiEndpoint {
    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// One event as sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawWatchEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub object: serde_json::Value,
}

impl RawWatchEvent {
    pub fn new(event_type: impl Into<String>, object: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            object,
        }
    }
}

/// Stream of raw watch events for one open watch
pub type RawEventStream = Pin<Box<dyn Stream<Item = anyhow::Result<RawWatchEvent>> + Send>>;

/// Transport to the cluster API server
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List a collection; returns the list document (items under `items`)
    async fn list(&self, endpoint: &ApiEndpoint) -> anyhow::Result<serde_json::Value>;

    /// Open a watch on a collection
    async fn watch(&self, endpoint: &ApiEndpoint) -> anyhow::Result<RawEventStream>;
}

/// List/watch access to one kind's collection
#[async_trait]
pub trait ResourceProxy: Send + Sync {
    /// Kind name this proxy was resolved for
    fn kind(&self) -> &str;

    /// Perform one list call and return every current item
    async fn get_all(&self) -> Result<Vec<ResourceItem>>;

    /// Open a watch stream
    async fn watch(&self) -> Result<ResourceWatch>;
}

/// How raw objects of a kind become items
#[derive(Debug, Clone)]
enum ItemShape {
    Builtin(Option<&'static [&'static str]>),
    Custom(Option<Arc<[String]>>),
}

impl ItemShape {
    fn decode(&self, kind: &str, raw: serde_json::Value) -> Result<ResourceItem> {
        match self {
            ItemShape::Builtin(path) => ResourceItem::builtin(kind, raw, *path),
            ItemShape::Custom(path) => ResourceItem::custom(kind, raw, path.as_deref()),
        }
    }
}

/// Proxy for a built-in kind with a known schema
pub struct BuiltinProxy {
    name: String,
    descriptor: &'static KindDescriptor,
    client: Arc<dyn ClusterApi>,
    metrics: TallyMetrics,
}

impl BuiltinProxy {
    pub fn new(descriptor: &'static KindDescriptor, client: Arc<dyn ClusterApi>) -> Self {
        Self {
            name: descriptor.name.to_string(),
            descriptor,
            client,
            metrics: TallyMetrics::new(),
        }
    }

    pub fn descriptor(&self) -> &'static KindDescriptor {
        self.descriptor
    }
}

#[derive(Deserialize)]
struct ItemList {
    #[serde(default)]
    items: Option<Vec<serde_json::Value>>,
}

#[async_trait]
impl ResourceProxy for BuiltinProxy {
    fn kind(&self) -> &str {
        &self.name
    }

    async fn get_all(&self) -> Result<Vec<ResourceItem>> {
        let document = timed_list(&self.name, &self.descriptor.endpoint(), &self.client, &self.metrics).await?;

        let list: ItemList = serde_json::from_value(document)
            .map_err(|e| Error::malformed(&self.name, format!("list response: {e}")))?;

        let shape = ItemShape::Builtin(self.descriptor.pod_spec_path);
        list.items
            .unwrap_or_default()
            .into_iter()
            .map(|raw| shape.decode(&self.name, raw))
            .collect()
    }

    async fn watch(&self) -> Result<ResourceWatch> {
        let events = self
            .client
            .watch(&self.descriptor.endpoint())
            .await
            .map_err(|e| Error::api(&self.name, e))?;

        Ok(ResourceWatch::new(
            &self.name,
            events,
            ItemShape::Builtin(self.descriptor.pod_spec_path),
        ))
    }
}

/// Proxy for a custom kind whose schema is unknown
pub struct CustomProxy {
    name: String,
    custom: CustomKind,
    pod_spec_path: Option<Arc<[String]>>,
    client: Arc<dyn ClusterApi>,
    metrics: TallyMetrics,
}

impl CustomProxy {
    pub fn new(name: impl Into<String>, custom: CustomKind, client: Arc<dyn ClusterApi>) -> Self {
        let pod_spec_path = custom.pod_spec_path.clone().map(Arc::from);
        Self {
            name: name.into(),
            custom,
            pod_spec_path,
            client,
            metrics: TallyMetrics::new(),
        }
    }

    pub fn custom_kind(&self) -> &CustomKind {
        &self.custom
    }
}

#[async_trait]
impl ResourceProxy for CustomProxy {
    fn kind(&self) -> &str {
        &self.name
    }

    async fn get_all(&self) -> Result<Vec<ResourceItem>> {
        let mut document =
            timed_list(&self.name, &self.custom.endpoint(), &self.client, &self.metrics).await?;

        let items = match document.get_mut("items").map(serde_json::Value::take) {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(items)) => items,
            Some(_) => {
                return Err(Error::malformed(&self.name, "list response items is not a list"))
            }
        };

        let shape = ItemShape::Custom(self.pod_spec_path.clone());
        items
            .into_iter()
            .map(|raw| shape.decode(&self.name, raw))
            .collect()
    }

    async fn watch(&self) -> Result<ResourceWatch> {
        let events = self
            .client
            .watch(&self.custom.endpoint())
            .await
            .map_err(|e| Error::api(&self.name, e))?;

        Ok(ResourceWatch::new(
            &self.name,
            events,
            ItemShape::Custom(self.pod_spec_path.clone()),
        ))
    }
}

async fn timed_list(
    kind: &str,
    endpoint: &ApiEndpoint,
    client: &Arc<dyn ClusterApi>,
    metrics: &TallyMetrics,
) -> Result<serde_json::Value> {
    let start = Instant::now();
    let result = client.list(endpoint).await;
    metrics.observe_list_latency(kind, start.elapsed().as_secs_f64());

    result.map_err(|e| {
        metrics.inc_list_errors(kind);
        warn!(kind = %kind, api_version = %endpoint.api_version(), error = %e, "List call failed");
        Error::api(kind, e)
    })
}

/// Server status carried by an `ERROR` event
#[derive(Debug, Default, Deserialize)]
struct WatchStatus {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// One open watch stream, yielding classified events
///
/// `next` returns `None` once the stream is over: the server closed it, sent
/// the expiry status, or stayed silent past the idle timeout. Reopening is
/// up to the caller.
pub struct ResourceWatch {
    kind: String,
    events: RawEventStream,
    shape: ItemShape,
    idle_timeout: Option<Duration>,
    finished: bool,
    metrics: TallyMetrics,
}

impl ResourceWatch {
    fn new(kind: &str, events: RawEventStream, shape: ItemShape) -> Self {
        Self {
            kind: kind.to_string(),
            events,
            shape,
            idle_timeout: None,
            finished: false,
            metrics: TallyMetrics::new(),
        }
    }

    /// Bound every receive; a receive that times out ends the stream like expiry
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Wait for the next classified event
    pub async fn next(&mut self) -> Option<Result<WatchEvent>> {
        if self.finished {
            return None;
        }

        let received = match self.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.events.next()).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(kind = %self.kind, timeout_secs = limit.as_secs(), "Watch idle past timeout");
                    return self.finish(None);
                }
            },
            None => self.events.next().await,
        };

        let raw = match received {
            None => {
                debug!(kind = %self.kind, "Watch stream closed by server");
                return self.finish(None);
            }
            Some(Err(e)) => return self.finish(Some(Err(Error::api(&self.kind, e)))),
            Some(Ok(raw)) => raw,
        };

        self.metrics.inc_watch_event(&self.kind, &raw.event_type);

        match raw.event_type.as_str() {
            "ADDED" => Some(self.shape.decode(&self.kind, raw.object).map(WatchEvent::Added)),
            "MODIFIED" => Some(self.shape.decode(&self.kind, raw.object).map(WatchEvent::Modified)),
            "DELETED" => Some(self.shape.decode(&self.kind, raw.object).map(WatchEvent::Deleted)),
            "ERROR" => {
                let status: WatchStatus = serde_json::from_value(raw.object).unwrap_or_default();
                if status.code == Some(EXPIRED_STATUS) {
                    debug!(kind = %self.kind, message = ?status.message, "Watch resource version expired");
                    return self.finish(None);
                }

                let reason = status
                    .message
                    .or(status.reason)
                    .unwrap_or_else(|| "unknown watch error".to_string());
                self.finish(Some(Err(Error::Watch {
                    kind: self.kind.clone(),
                    reason,
                })))
            }
            other => {
                let err = Error::UnknownEvent {
                    kind: self.kind.clone(),
                    event_type: other.to_string(),
                };
                self.finish(Some(Err(err)))
            }
        }
    }

    fn finish(&mut self, last: Option<Result<WatchEvent>>) -> Option<Result<WatchEvent>> {
        self.finished = true;
        last
    }
}
