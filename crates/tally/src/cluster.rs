//! Cluster API transport backed by kube

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, WatchEvent, WatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::json;
use tally_lib::{ApiEndpoint, ClusterApi, RawEventStream, RawWatchEvent};
use tokio_stream::StreamExt;
use tracing::{debug, info};

/// List/watch over every namespace using untyped objects
pub struct KubeCluster {
    client: Client,
    server_timeout_secs: u32,
}

impl KubeCluster {
    /// Connect using the ambient kubeconfig or in-cluster service account
    pub async fn connect(server_timeout_secs: u64) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        info!(server_timeout_secs, "Connected to Kubernetes cluster");

        Ok(Self {
            client,
            server_timeout_secs: u32::try_from(server_timeout_secs)
                .context("server timeout out of range")?,
        })
    }

    fn api(&self, endpoint: &ApiEndpoint) -> Api<DynamicObject> {
        let resource = ApiResource {
            group: endpoint.group.clone(),
            version: endpoint.version.clone(),
            api_version: endpoint.api_version(),
            kind: endpoint.kind.clone(),
            plural: endpoint.plural.clone(),
        };
        Api::all_with(self.client.clone(), &resource)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list(&self, endpoint: &ApiEndpoint) -> Result<serde_json::Value> {
        let list = self
            .api(endpoint)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list {}", endpoint.plural))?;
        debug!(plural = %endpoint.plural, items = list.items.len(), "Listed objects");

        serde_json::to_value(list).context("Failed to encode list response")
    }

    async fn watch(&self, endpoint: &ApiEndpoint) -> Result<RawEventStream> {
        let params = WatchParams::default()
            .timeout(self.server_timeout_secs)
            .disable_bookmarks();
        let plural = endpoint.plural.clone();

        // "0" asks the server to start from any recent state, replaying current objects
        let stream = self
            .api(endpoint)
            .watch(&params, "0")
            .await
            .with_context(|| format!("Failed to watch {}", endpoint.plural))?;

        let events = stream.filter_map(move |event| match event {
            Ok(event) => raw_event(event),
            Err(e) => Some(Err(anyhow::Error::new(e).context(format!("Watch stream for {plural} broke")))),
        });
        Ok(Box::pin(events))
    }
}

/// Translate a kube watch event into its wire form; bookmarks are dropped
fn raw_event(event: WatchEvent<DynamicObject>) -> Option<Result<RawWatchEvent>> {
    let (event_type, object) = match event {
        WatchEvent::Added(object) => ("ADDED", object),
        WatchEvent::Modified(object) => ("MODIFIED", object),
        WatchEvent::Deleted(object) => ("DELETED", object),
        WatchEvent::Bookmark(_) => return None,
        WatchEvent::Error(status) => {
            return Some(Ok(RawWatchEvent::new(
                "ERROR",
                json!({
                    "code": status.code,
                    "message": status.message,
                    "reason": status.reason,
                    "status": status.status,
                }),
            )))
        }
    };

    Some(
        serde_json::to_value(object)
            .map(|object| RawWatchEvent::new(event_type, object))
            .context("Failed to encode watch object"),
    )
}
