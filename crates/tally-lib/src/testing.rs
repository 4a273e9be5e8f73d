//! In-memory cluster used by unit tests

use crate::proxy::{ApiEndpoint, ClusterApi, RawEventStream, RawWatchEvent};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Scripted cluster: fixed list response, one scripted event stream per watch call
pub struct ScriptedCluster {
    items: Vec<serde_json::Value>,
    list_error: Option<String>,
    streams: Mutex<VecDeque<Vec<RawWatchEvent>>>,
    plural_streams: Mutex<HashMap<String, VecDeque<Vec<RawWatchEvent>>>>,
    hang_after_script: bool,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
    listed: Mutex<Vec<ApiEndpoint>>,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            list_error: None,
            streams: Mutex::new(VecDeque::new()),
            plural_streams: Mutex::new(HashMap::new()),
            hang_after_script: false,
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
            listed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_items(items: Vec<serde_json::Value>) -> Self {
        Self {
            items,
            ..Self::new()
        }
    }

    pub fn failing_list(message: &str) -> Self {
        Self {
            list_error: Some(message.to_string()),
            ..Self::new()
        }
    }

    pub fn with_streams(streams: Vec<Vec<RawWatchEvent>>) -> Self {
        Self {
            streams: Mutex::new(streams.into()),
            ..Self::new()
        }
    }

    /// Script the streams for one collection only
    pub fn with_plural_streams(self, plural: &str, streams: Vec<Vec<RawWatchEvent>>) -> Self {
        self.plural_streams
            .lock()
            .unwrap()
            .insert(plural.to_string(), streams.into());
        self
    }

    /// Keep each scripted stream open (silent) after its last event
    pub fn hang_after_script(mut self) -> Self {
        self.hang_after_script = true;
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn listed_endpoints(&self) -> Vec<ApiEndpoint> {
        self.listed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for ScriptedCluster {
    async fn list(&self, endpoint: &ApiEndpoint) -> anyhow::Result<serde_json::Value> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.listed.lock().unwrap().push(endpoint.clone());

        if let Some(message) = &self.list_error {
            anyhow::bail!("{}", message);
        }
        Ok(json!({ "items": self.items }))
    }

    async fn watch(&self, endpoint: &ApiEndpoint) -> anyhow::Result<RawEventStream> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);

        let scoped = self
            .plural_streams
            .lock()
            .unwrap()
            .get_mut(&endpoint.plural)
            .map(VecDeque::pop_front);
        let script = match scoped {
            Some(script) => script,
            None => self.streams.lock().unwrap().pop_front(),
        };
        let stream: RawEventStream = match script {
            Some(events) => {
                let scripted = tokio_stream::iter(events.into_iter().map(Ok));
                if self.hang_after_script {
                    Box::pin(tokio_stream::StreamExt::chain(scripted, tokio_stream::pending()))
                } else {
                    Box::pin(scripted)
                }
            }
            None => Box::pin(tokio_stream::pending()),
        };
        Ok(stream)
    }
}

pub fn pod(name: &str, cpu_request: Option<&str>) -> serde_json::Value {
    let resources = match cpu_request {
        Some(cpu) => json!({"requests": {"cpu": cpu}}),
        None => json!({}),
    };
    json!({
        "metadata": {"name": name, "namespace": "default", "uid": format!("uid-{name}")},
        "spec": {"containers": [{"name": "main", "resources": resources}]}
    })
}

pub fn added(name: &str) -> RawWatchEvent {
    RawWatchEvent::new("ADDED", pod(name, Some("100m")))
}

pub fn expired() -> RawWatchEvent {
    RawWatchEvent::new(
        "ERROR",
        json!({"code": 410, "reason": "Expired", "message": "too old resource version"}),
    )
}

pub fn error_event(message: &str) -> RawWatchEvent {
    RawWatchEvent::new(
        "ERROR",
        json!({"code": 500, "reason": "InternalError", "message": message}),
    )
}
