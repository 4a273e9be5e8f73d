//! Resource items and watch events
//!
//! Items keep the object as a generic [`Value`] tree so custom kinds with an
//! unknown schema are handled the same way as built-in ones. Container
//! resource requirements are extracted once, when the item is built.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Generic tree value for objects whose schema is not known at compile time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Look up a key when this value is a map
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Walk a path of map keys
    pub fn path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        path.iter()
            .try_fold(self, |current, key| current.get(key.as_ref()))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(raw: serde_json::Value) -> Self {
        match raw {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Resource requirements declared by a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, String>>,
}

/// A container and its declared resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Container {
    /// Requests declared by this container; `None` when missing or empty
    pub fn requests(&self) -> Option<&BTreeMap<String, String>> {
        self.resources.requests.as_ref().filter(|r| !r.is_empty())
    }

    /// Build a container from a generic tree node
    fn from_value(value: &Value) -> std::result::Result<Self, String> {
        if value.as_map().is_none() {
            return Err("container entry is not a map".to_string());
        }

        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let resources = match value.get("resources") {
            None | Some(Value::Null) => ResourceRequirements::default(),
            Some(resources) => ResourceRequirements {
                requests: quantity_map(resources.get("requests"))?,
                limits: quantity_map(resources.get("limits"))?,
            },
        };

        Ok(Self { name, resources })
    }
}

fn quantity_map(value: Option<&Value>) -> std::result::Result<Option<BTreeMap<String, String>>, String> {
    let map = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Map(map)) => map,
        Some(_) => return Err("resource quantities are not a map".to_string()),
    };

    map.iter()
        .map(|(key, v)| match v {
            Value::String(s) => Ok((key.clone(), s.clone())),
            Value::Number(n) => Ok((key.clone(), n.to_string())),
            _ => Err(format!("quantity for {key} is not a string or number")),
        })
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()
        .map(Some)
}

/// One cluster object at a point in time, tagged with its kind
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceItem {
    kind: String,
    object: Value,
    containers: Vec<Container>,
}

impl ResourceItem {
    /// Create an item from already extracted parts
    pub fn new(kind: impl Into<String>, object: Value, containers: Vec<Container>) -> Self {
        Self {
            kind: kind.into(),
            object,
            containers,
        }
    }

    /// Build an item for a built-in kind
    ///
    /// The container list is decoded with the known schema; a pod spec that
    /// does not match it is reported as [`Error::MalformedItem`].
    pub fn builtin<S: AsRef<str>>(
        kind: &str,
        raw: serde_json::Value,
        pod_spec_path: Option<&[S]>,
    ) -> Result<Self> {
        if !raw.is_object() {
            return Err(Error::malformed(kind, "object is not a map"));
        }

        let containers = match pod_spec_path {
            Some(path) => {
                let pointer = json_pointer(path, "containers");
                match raw.pointer(&pointer) {
                    None | Some(serde_json::Value::Null) => Vec::new(),
                    Some(containers) => serde_json::from_value(containers.clone())
                        .map_err(|e| Error::malformed(kind, e.to_string()))?,
                }
            }
            None => Vec::new(),
        };

        Ok(Self::new(kind, Value::from(raw), containers))
    }

    /// Build an item for a custom kind from its raw nested map
    pub fn custom<S: AsRef<str>>(
        kind: &str,
        raw: serde_json::Value,
        pod_spec_path: Option<&[S]>,
    ) -> Result<Self> {
        let object = Value::from(raw);
        if object.as_map().is_none() {
            return Err(Error::malformed(kind, "object is not a map"));
        }

        let containers = match pod_spec_path.and_then(|path| object.path(path)) {
            Some(spec) => match spec.get("containers") {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::List(entries)) => entries
                    .iter()
                    .map(Container::from_value)
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| Error::malformed(kind, e))?,
                Some(_) => return Err(Error::malformed(kind, "containers is not a list")),
            },
            None => Vec::new(),
        };

        Ok(Self::new(kind, object, containers))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn object(&self) -> &Value {
        &self.object
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn name(&self) -> Option<&str> {
        self.object.path(&["metadata", "name"]).and_then(Value::as_str)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.object
            .path(&["metadata", "namespace"])
            .and_then(Value::as_str)
    }

    pub fn uid(&self) -> Option<&str> {
        self.object.path(&["metadata", "uid"]).and_then(Value::as_str)
    }

    /// Identity used to correlate events for the same object
    ///
    /// The uid when the server set one, otherwise `namespace/name`.
    pub fn key(&self) -> String {
        match self.uid() {
            Some(uid) => format!("{}:{}", self.kind, uid),
            None => format!(
                "{}:{}/{}",
                self.kind,
                self.namespace().unwrap_or_default(),
                self.name().unwrap_or_default()
            ),
        }
    }
}

fn json_pointer<S: AsRef<str>>(path: &[S], leaf: &str) -> String {
    let mut pointer = String::new();
    for segment in path.iter().map(AsRef::as_ref).chain(std::iter::once(leaf)) {
        pointer.push('/');
        pointer.push_str(&segment.replace('~', "~0").replace('/', "~1"));
    }
    pointer
}

/// A classified change event for one item
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(ResourceItem),
    Modified(ResourceItem),
    Deleted(ResourceItem),
}

impl WatchEvent {
    pub fn item(&self) -> &ResourceItem {
        match self {
            WatchEvent::Added(item) | WatchEvent::Modified(item) | WatchEvent::Deleted(item) => {
                item
            }
        }
    }

    pub fn kind(&self) -> &str {
        self.item().kind()
    }

    /// Wire name of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
        }
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.event_type(), self.item().key())
    }
}
