//! Object identity and metadata shared by every resource kind.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::condition::Condition;

/// Errors raised while interpreting user-supplied resource fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// A `namespace/name` reference did not have exactly two non-empty parts.
    #[error("invalid object reference '{0}': expected 'namespace/name'")]
    InvalidKey(String),

    /// A duration string could not be parsed.
    #[error("invalid interval '{value}': {reason}")]
    InvalidInterval { value: String, reason: String },

    /// A spec field failed validation.
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Namespace-qualified object name, the unit of reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = ResourceError;

    /// Parses `namespace/name`. Both halves must be non-empty and the string
    /// must contain exactly one separator.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(name), None) if !ns.is_empty() && !name.is_empty() => {
                Ok(Self::new(ns, name))
            }
            _ => Err(ResourceError::InvalidKey(s.to_string())),
        }
    }
}

/// Reference from a dependent object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

/// Identity of the object an event or log line is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// Store-managed metadata carried by every object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// True once a delete has been requested but finalizers are still pending.
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds the finalizer; returns `true` if the list changed.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes the finalizer; returns `true` if the list changed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_references.iter().any(|o| o.uid == uid)
    }
}

/// A resource kind stored in the object store.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Kind name, also used as the store collection name.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }

    fn object_ref(&self) -> ObjectReference {
        let meta = self.meta();
        ObjectReference {
            kind: Self::KIND.to_string(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
        }
    }

    /// Controller owner reference pointing at this object.
    fn controller_ref(&self) -> OwnerReference {
        let meta = self.meta();
        OwnerReference {
            kind: Self::KIND.to_string(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
            controller: true,
        }
    }
}

/// Resources whose status carries a condition set.
pub trait HasConditions: Resource {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Parses a polling/drift interval such as `5s`, `1m30s` or `2h`.
///
/// Zero-length intervals are rejected since they would turn a polling loop
/// into a busy loop.
pub fn parse_interval(value: &str) -> Result<Duration, ResourceError> {
    let trimmed = value.trim();
    let duration =
        humantime::parse_duration(trimmed).map_err(|e| ResourceError::InvalidInterval {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
    if duration.is_zero() {
        return Err(ResourceError::InvalidInterval {
            value: value.to_string(),
            reason: "interval must be greater than zero".to_string(),
        });
    }
    Ok(duration)
}
