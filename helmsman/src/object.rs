//! Managed objects - the desired/live state records the engine converges.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Composite identity of a managed object: `(kind, name)`.
///
/// The text form is `Kind/name`, split at the first `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Error returned when a string is not of the form `Kind/name`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object key '{0}', expected Kind/name")]
pub struct ParseKeyError(pub String);

impl FromStr for ObjectKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() => {
                Ok(ObjectKey::new(kind, name))
            }
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

/// The application instance a set of managed objects belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

impl OwnerRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for OwnerRef {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: ObjectKey = s.parse()?;
        Ok(OwnerRef::new(key.kind, key.name))
    }
}

/// One desired-state unit, or its live counterpart.
///
/// `kind` is the type tag used for readiness dispatch. `spec`
/// is the opaque definition to apply; `status` and `resource_version` are
/// written only by the live system and never take part in drift detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedObject {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(default)]
    pub resource_version: u64,
}

impl ManagedObject {
    pub fn new(key: ObjectKey, spec: Value) -> Self {
        Self {
            kind: key.kind,
            name: key.name,
            owner: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec,
            status: None,
            resource_version: 0,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.kind, &self.name)
    }

    pub fn with_owner(mut self, owner: OwnerRef) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: Value) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_owned_by(&self, owner: &OwnerRef) -> bool {
        self.owner.as_ref() == Some(owner)
    }

    /// Whether `live` already carries this object's definition.
    ///
    /// Compares identity, owner, labels and spec, and requires every desired
    /// annotation to be present with the same value. Status, live-only
    /// annotations and the resource version belong to the live system and are
    /// ignored.
    pub fn matches(&self, live: &ManagedObject) -> bool {
        self.kind == live.kind
            && self.name == live.name
            && self.owner == live.owner
            && self.labels == live.labels
            && self.spec == live.spec
            && self
                .annotations
                .iter()
                .all(|(k, v)| live.annotations.get(k) == Some(v))
    }

    /// Field lookup in `spec` by a dotted path, e.g. `"template.replicas"`.
    pub fn spec_field(&self, path: &str) -> Option<&Value> {
        lookup(&self.spec, path)
    }

    /// Field lookup in `status` by a dotted path.
    pub fn status_field(&self, path: &str) -> Option<&Value> {
        self.status.as_ref().and_then(|s| lookup(s, path))
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |v, segment| v.get(segment))
}
