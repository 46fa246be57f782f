//! Object store contract.
//!
//! The operator only ever talks to its objects through [`ObjectStore`]: a
//! transactional document store with list/get/create/replace/delete, a
//! separate status write path, optimistic concurrency on `resourceVersion`,
//! finalizer-gated deletion, owner-reference garbage collection and a watch
//! stream. [`Api`] is the typed view reconcilers use.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::resource::{ObjectKey, Resource};

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },

    /// The write carried a stale `resourceVersion`.
    #[error("conflict updating {kind} {key}: expected resourceVersion {expected}, found {actual}")]
    Conflict {
        kind: String,
        key: ObjectKey,
        expected: String,
        actual: String,
    },

    #[error("invalid object: {message}")]
    Invalid { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(kind: impl Into<String>, key: ObjectKey) -> Self {
        Self::NotFound {
            kind: kind.into(),
            key,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Filter for list operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ListParams {
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: String,
    pub key: ObjectKey,
    pub event_type: WatchEventType,
}

/// Untyped store contract. Objects are JSON documents with `metadata`,
/// `spec` and `status` members.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns `None` when the object does not exist.
    async fn get(&self, kind: &str, key: &ObjectKey) -> Result<Option<Value>, StoreError>;

    async fn list(&self, kind: &str, params: &ListParams) -> Result<Vec<Value>, StoreError>;

    /// Stores a new object, assigning uid, creation timestamp, generation
    /// and resource version.
    async fn create(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Replaces metadata and spec; the stored status is kept. Removes the
    /// object when it is being deleted and the finalizer list became empty.
    async fn replace(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Replaces status only.
    async fn replace_status(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Requests deletion. Objects with finalizers are only marked.
    async fn delete(&self, kind: &str, key: &ObjectKey) -> Result<(), StoreError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;

    fn backend_name(&self) -> &'static str;
}

/// Typed access to one resource kind.
pub struct Api<K> {
    store: Arc<dyn ObjectStore>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Api<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _kind: PhantomData,
        }
    }
}

impl<K: Resource> Api<K> {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }

    pub async fn get(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        match self.store.get(K::KIND, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, params: &ListParams) -> Result<Vec<K>, StoreError> {
        self.store
            .list(K::KIND, params)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .collect()
    }

    pub async fn create(&self, object: &K) -> Result<K, StoreError> {
        let stored = self
            .store
            .create(K::KIND, serde_json::to_value(object)?)
            .await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn replace(&self, object: &K) -> Result<K, StoreError> {
        let stored = self
            .store
            .replace(K::KIND, serde_json::to_value(object)?)
            .await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn replace_status(&self, object: &K) -> Result<K, StoreError> {
        let stored = self
            .store
            .replace_status(K::KIND, serde_json::to_value(object)?)
            .await?;
        Ok(serde_json::from_value(stored)?)
    }

    pub async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.store.delete(K::KIND, key).await
    }
}
