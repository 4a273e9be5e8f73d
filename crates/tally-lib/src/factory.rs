//! Kind registry and proxy factory
//!
//! Built-in kinds come from a static table; custom kinds are registered by
//! name when the factory is built and never change afterwards.

use crate::error::{Error, Result};
use crate::proxy::{ApiEndpoint, BuiltinProxy, ClusterApi, CustomProxy, ResourceProxy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Prefix for inline custom kind names: `custom:group/version/plural`
pub const CUSTOM_PREFIX: &str = "custom:";

const POD: &[&str] = &["spec"];
const POD_TEMPLATE: &[&str] = &["spec", "template", "spec"];
const JOB_TEMPLATE: &[&str] = &["spec", "jobTemplate", "spec", "template", "spec"];

/// Static description of a built-in kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindDescriptor {
    /// Name used to request the kind
    pub name: &'static str,
    pub group: &'static str,
    pub version: &'static str,
    pub plural: &'static str,
    pub kind: &'static str,
    /// Path to the embedded pod spec, for kinds that carry containers
    pub pod_spec_path: Option<&'static [&'static str]>,
}

impl KindDescriptor {
    pub fn endpoint(&self) -> ApiEndpoint {
        ApiEndpoint {
            group: self.group.to_string(),
            version: self.version.to_string(),
            plural: self.plural.to_string(),
            kind: self.kind.to_string(),
        }
    }
}

macro_rules! kind {
    ($name:literal, $group:literal, $version:literal, $plural:literal, $kind:literal) => {
        kind!($name, $group, $version, $plural, $kind, None)
    };
    ($name:literal, $group:literal, $version:literal, $plural:literal, $kind:literal, $pod:expr) => {
        KindDescriptor {
            name: $name,
            group: $group,
            version: $version,
            plural: $plural,
            kind: $kind,
            pod_spec_path: $pod,
        }
    };
}

/// Every built-in kind the factory resolves
pub static BUILTIN_KINDS: &[KindDescriptor] = &[
    kind!("pod", "", "v1", "pods", "Pod", Some(POD)),
    kind!("service", "", "v1", "services", "Service"),
    kind!("endpoints", "", "v1", "endpoints", "Endpoints"),
    kind!("config_map", "", "v1", "configmaps", "ConfigMap"),
    kind!("secret", "", "v1", "secrets", "Secret"),
    kind!("node", "", "v1", "nodes", "Node"),
    kind!("deployment", "apps", "v1", "deployments", "Deployment", Some(POD_TEMPLATE)),
    kind!("stateful_set", "apps", "v1", "statefulsets", "StatefulSet", Some(POD_TEMPLATE)),
    kind!("daemon_set", "apps", "v1", "daemonsets", "DaemonSet", Some(POD_TEMPLATE)),
    kind!("replica_set", "apps", "v1", "replicasets", "ReplicaSet", Some(POD_TEMPLATE)),
    kind!("storage_class", "storage.k8s.io", "v1", "storageclasses", "StorageClass"),
    kind!("persistent_volume", "", "v1", "persistentvolumes", "PersistentVolume"),
    kind!(
        "persistent_volume_claim",
        "",
        "v1",
        "persistentvolumeclaims",
        "PersistentVolumeClaim"
    ),
    kind!("namespace", "", "v1", "namespaces", "Namespace"),
    kind!(
        "horizontal_pod_autoscaler",
        "autoscaling",
        "v1",
        "horizontalpodautoscalers",
        "HorizontalPodAutoscaler"
    ),
    kind!("ingress", "networking.k8s.io", "v1", "ingresses", "Ingress"),
    kind!("job", "batch", "v1", "jobs", "Job", Some(POD_TEMPLATE)),
    kind!("cron_job", "batch", "v1", "cronjobs", "CronJob", Some(JOB_TEMPLATE)),
];

/// Look up a built-in kind by name
pub fn builtin(name: &str) -> Option<&'static KindDescriptor> {
    BUILTIN_KINDS.iter().find(|d| d.name == name)
}

/// Coordinates of a custom kind, supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub plural: String,
    /// Object kind; defaults to the plural
    #[serde(default)]
    pub kind: Option<String>,
    /// Path to a pod spec inside the object, when it carries containers
    #[serde(default)]
    pub pod_spec_path: Option<Vec<String>>,
}

impl CustomKind {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        plural: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            plural: plural.into(),
            kind: None,
            pod_spec_path: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_pod_spec_path<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pod_spec_path = Some(path.into_iter().map(Into::into).collect());
        self
    }

    /// Parse an inline `custom:group/version/plural` name
    pub fn parse_inline(name: &str) -> Option<Self> {
        let coordinates = name.strip_prefix(CUSTOM_PREFIX)?;
        let mut parts = coordinates.split('/');
        let (group, version, plural) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() || version.is_empty() || plural.is_empty() {
            return None;
        }
        Some(Self::new(group, version, plural))
    }

    pub fn endpoint(&self) -> ApiEndpoint {
        ApiEndpoint {
            group: self.group.clone(),
            version: self.version.clone(),
            plural: self.plural.clone(),
            kind: self.kind.clone().unwrap_or_else(|| self.plural.clone()),
        }
    }
}

/// Resolves kind names to configured proxies
pub struct ProxyFactory {
    client: Arc<dyn ClusterApi>,
    custom: BTreeMap<String, CustomKind>,
}

impl ProxyFactory {
    /// Start building a factory over the given cluster transport
    pub fn builder(client: Arc<dyn ClusterApi>) -> ProxyFactoryBuilder {
        ProxyFactoryBuilder::new(client)
    }

    /// Resolve a kind name
    ///
    /// Registered custom names are checked first, then inline
    /// `custom:group/version/plural` names, then the built-in table.
    pub fn get(&self, name: &str) -> Result<Arc<dyn ResourceProxy>> {
        if let Some(custom) = self.custom.get(name) {
            debug!(kind = %name, plural = %custom.plural, "Resolved registered custom kind");
            return Ok(Arc::new(CustomProxy::new(name, custom.clone(), self.client.clone())));
        }

        if name.starts_with(CUSTOM_PREFIX) {
            let custom =
                CustomKind::parse_inline(name).ok_or_else(|| Error::UnknownKind(name.to_string()))?;
            return Ok(Arc::new(CustomProxy::new(name, custom, self.client.clone())));
        }

        builtin(name)
            .map(|descriptor| {
                Arc::new(BuiltinProxy::new(descriptor, self.client.clone())) as Arc<dyn ResourceProxy>
            })
            .ok_or_else(|| Error::UnknownKind(name.to_string()))
    }

    /// Every name this factory resolves (inline custom names excluded)
    pub fn kinds(&self) -> Vec<String> {
        BUILTIN_KINDS
            .iter()
            .map(|d| d.name.to_string())
            .chain(self.custom.keys().cloned())
            .collect()
    }
}

/// Builder for [`ProxyFactory`]
pub struct ProxyFactoryBuilder {
    client: Arc<dyn ClusterApi>,
    custom: BTreeMap<String, CustomKind>,
}

impl ProxyFactoryBuilder {
    pub fn new(client: Arc<dyn ClusterApi>) -> Self {
        Self {
            client,
            custom: BTreeMap::new(),
        }
    }

    /// Register a custom kind under a name
    pub fn custom_kind(mut self, name: impl Into<String>, kind: CustomKind) -> Self {
        let name = name.into();
        if builtin(&name).is_some() {
            warn!(kind = %name, "Custom kind shadows a built-in kind of the same name");
        }
        self.custom.insert(name, kind);
        self
    }

    pub fn build(self) -> ProxyFactory {
        ProxyFactory {
            client: self.client,
            custom: self.custom,
        }
    }
}
