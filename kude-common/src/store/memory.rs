//! In-memory [`ObjectStore`] backend.
//!
//! Provides:
//! - per-kind collections keyed by `namespace/name`
//! - monotonically increasing resource versions with conflict detection
//! - finalizer-gated deletion and owner-reference cascade
//! - a broadcast watch stream of every change

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use super::{ListParams, ObjectStore, StoreError, WatchEvent, WatchEventType};
use crate::resource::{ObjectKey, ObjectMeta};

const WATCH_BUFFER: usize = 1024;
const DEFAULT_NAMESPACE: &str = "default";

type Collection = BTreeMap<ObjectKey, Value>;

pub struct InMemoryStore {
    objects: RwLock<HashMap<String, Collection>>,
    version_counter: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            objects: RwLock::new(HashMap::new()),
            version_counter: AtomicU64::new(1),
            events,
        }
    }

    fn next_version(&self) -> String {
        self.version_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    fn emit(&self, kind: &str, key: &ObjectKey, event_type: WatchEventType) {
        // No receivers is fine: nothing is watching yet.
        let _ = self.events.send(WatchEvent {
            kind: kind.to_string(),
            key: key.clone(),
            event_type,
        });
    }

    /// Removes an object and cascades to everything it owns. Dependents with
    /// finalizers are marked for deletion instead of removed.
    fn remove_cascading(&self, objects: &mut HashMap<String, Collection>, kind: &str, key: &ObjectKey) {
        let mut pending = vec![(kind.to_string(), key.clone())];
        while let Some((kind, key)) = pending.pop() {
            let Some(removed) = objects.get_mut(&kind).and_then(|c| c.remove(&key)) else {
                continue;
            };
            self.emit(&kind, &key, WatchEventType::Deleted);
            let Ok(meta) = read_meta(&removed) else {
                continue;
            };
            if meta.uid.is_empty() {
                continue;
            }
            debug!(kind = %kind, key = %key, uid = %meta.uid, "object removed, collecting dependents");

            for (dep_kind, collection) in objects.iter_mut() {
                for (dep_key, dep) in collection.iter_mut() {
                    let Ok(mut dep_meta) = read_meta(dep) else {
                        continue;
                    };
                    if !dep_meta.is_owned_by(&meta.uid) {
                        continue;
                    }
                    if dep_meta.finalizers.is_empty() {
                        pending.push((dep_kind.clone(), dep_key.clone()));
                    } else if dep_meta.deletion_timestamp.is_none() {
                        dep_meta.deletion_timestamp = Some(Utc::now());
                        dep_meta.resource_version = self.next_version();
                        if write_meta(dep, &dep_meta).is_ok() {
                            let _ = self.events.send(WatchEvent {
                                kind: dep_kind.clone(),
                                key: dep_key.clone(),
                                event_type: WatchEventType::Modified,
                            });
                        }
                    }
                }
            }
        }
    }
}

fn read_meta(object: &Value) -> Result<ObjectMeta, StoreError> {
    let meta = object
        .get("metadata")
        .cloned()
        .ok_or_else(|| StoreError::invalid("object has no metadata"))?;
    Ok(serde_json::from_value(meta)?)
}

fn write_meta(object: &mut Value, meta: &ObjectMeta) -> Result<(), StoreError> {
    let map = object
        .as_object_mut()
        .ok_or_else(|| StoreError::invalid("object is not a JSON map"))?;
    map.insert("metadata".to_string(), serde_json::to_value(meta)?);
    Ok(())
}

fn member(object: &Value, name: &str) -> Value {
    object.get(name).cloned().unwrap_or(Value::Null)
}

fn set_member(object: &mut Value, name: &str, value: Value) -> Result<(), StoreError> {
    let map = object
        .as_object_mut()
        .ok_or_else(|| StoreError::invalid("object is not a JSON map"))?;
    map.insert(name.to_string(), value);
    Ok(())
}

fn check_version(kind: &str, incoming: &ObjectMeta, stored: &ObjectMeta) -> Result<(), StoreError> {
    if !incoming.resource_version.is_empty() && incoming.resource_version != stored.resource_version {
        return Err(StoreError::Conflict {
            kind: kind.to_string(),
            key: stored.key(),
            expected: incoming.resource_version.clone(),
            actual: stored.resource_version.clone(),
        });
    }
    Ok(())
}

fn labels_match(meta: &ObjectMeta, params: &ListParams) -> bool {
    params
        .labels
        .iter()
        .all(|(k, v)| meta.labels.get(k).is_some_and(|actual| actual == v))
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, kind: &str, key: &ObjectKey) -> Result<Option<Value>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects.get(kind).and_then(|c| c.get(key)).cloned())
    }

    async fn list(&self, kind: &str, params: &ListParams) -> Result<Vec<Value>, StoreError> {
        let objects = self.objects.read().await;
        let Some(collection) = objects.get(kind) else {
            return Ok(Vec::new());
        };
        let mut items = Vec::new();
        for (key, object) in collection {
            if let Some(ns) = &params.namespace
                && &key.namespace != ns
            {
                continue;
            }
            let meta = read_meta(object)?;
            if labels_match(&meta, params) {
                items.push(object.clone());
            }
        }
        Ok(items)
    }

    async fn create(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let mut meta = read_meta(&object)?;
        if meta.name.is_empty() {
            return Err(StoreError::invalid("metadata.name is required"));
        }
        if meta.namespace.is_empty() {
            meta.namespace = DEFAULT_NAMESPACE.to_string();
        }
        let key = meta.key();

        let mut objects = self.objects.write().await;
        let collection = objects.entry(kind.to_string()).or_default();
        if collection.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: kind.to_string(),
                key,
            });
        }

        if meta.uid.is_empty() {
            meta.uid = uuid::Uuid::new_v4().to_string();
        }
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;
        meta.generation = 1;
        meta.resource_version = self.next_version();
        write_meta(&mut object, &meta)?;

        collection.insert(key.clone(), object.clone());
        self.emit(kind, &key, WatchEventType::Added);
        Ok(object)
    }

    async fn replace(&self, kind: &str, object: Value) -> Result<Value, StoreError> {
        let incoming = read_meta(&object)?;
        let key = incoming.key();

        let mut objects = self.objects.write().await;
        let stored = objects
            .get(kind)
            .and_then(|c| c.get(&key))
            .cloned()
            .ok_or_else(|| StoreError::not_found(kind, key.clone()))?;
        let stored_meta = read_meta(&stored)?;
        check_version(kind, &incoming, &stored_meta)?;

        let spec_changed = member(&object, "spec") != member(&stored, "spec");
        let mut meta = stored_meta.clone();
        meta.labels = incoming.labels;
        meta.finalizers = incoming.finalizers;
        meta.owner_references = incoming.owner_references;
        if spec_changed {
            meta.generation += 1;
        }

        if !spec_changed && meta == stored_meta {
            return Ok(stored);
        }

        let mut updated = stored;
        set_member(&mut updated, "spec", member(&object, "spec"))?;

        if meta.is_deleting() && meta.finalizers.is_empty() {
            write_meta(&mut updated, &meta)?;
            self.remove_cascading(&mut objects, kind, &key);
            return Ok(updated);
        }

        meta.resource_version = self.next_version();
        write_meta(&mut updated, &meta)?;
        if let Some(collection) = objects.get_mut(kind) {
            collection.insert(key.clone(), updated.clone());
        }
        self.emit(kind, &key, WatchEventType::Modified);
        Ok(updated)
    }

    async fn replace_status(&self, kind: &str, object: Value) -> Result<Value, StoreError> {
        let incoming = read_meta(&object)?;
        let key = incoming.key();

        let mut objects = self.objects.write().await;
        let collection = objects
            .get_mut(kind)
            .ok_or_else(|| StoreError::not_found(kind, key.clone()))?;
        let stored = collection
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found(kind, key.clone()))?;
        let mut meta = read_meta(stored)?;
        check_version(kind, &incoming, &meta)?;

        let status = member(&object, "status");
        if status == member(stored, "status") {
            return Ok(stored.clone());
        }
        set_member(stored, "status", status)?;
        meta.resource_version = self.next_version();
        write_meta(stored, &meta)?;
        let updated = stored.clone();
        self.emit(kind, &key, WatchEventType::Modified);
        Ok(updated)
    }

    async fn delete(&self, kind: &str, key: &ObjectKey) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        let stored = objects
            .get_mut(kind)
            .and_then(|c| c.get_mut(key))
            .ok_or_else(|| StoreError::not_found(kind, key.clone()))?;
        let mut meta = read_meta(stored)?;

        if meta.finalizers.is_empty() {
            self.remove_cascading(&mut objects, kind, key);
            return Ok(());
        }
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(Utc::now());
            meta.resource_version = self.next_version();
            write_meta(stored, &meta)?;
            self.emit(kind, key, WatchEventType::Modified);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(ns: &str, name: &str) -> Value {
        json!({
            "metadata": { "name": name, "namespace": ns },
            "spec": { "value": 1 },
        })
    }

    #[tokio::test]
    async fn create_assigns_identity_and_versions() {
        let store = InMemoryStore::new();
        let created = store.create("Thing", object("ns", "a")).await.unwrap();
        let meta = read_meta(&created).unwrap();
        assert!(!meta.uid.is_empty());
        assert_eq!(meta.generation, 1);
        assert!(!meta.resource_version.is_empty());
        assert!(meta.creation_timestamp.is_some());

        let err = store.create("Thing", object("ns", "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn replace_with_stale_version_conflicts() {
        let store = InMemoryStore::new();
        let created = store.create("Thing", object("ns", "a")).await.unwrap();

        let mut first = created.clone();
        first["spec"]["value"] = json!(2);
        store.replace("Thing", first).await.unwrap();

        let mut stale = created;
        stale["spec"]["value"] = json!(3);
        let err = store.replace("Thing", stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn generation_moves_only_with_spec() {
        let store = InMemoryStore::new();
        let created = store.create("Thing", object("ns", "a")).await.unwrap();

        let mut with_status = created.clone();
        with_status["status"] = json!({ "ok": true });
        let after_status = store.replace_status("Thing", with_status).await.unwrap();
        assert_eq!(read_meta(&after_status).unwrap().generation, 1);

        let mut with_spec = after_status.clone();
        with_spec["spec"]["value"] = json!(9);
        let after_spec = store.replace("Thing", with_spec).await.unwrap();
        assert_eq!(read_meta(&after_spec).unwrap().generation, 2);
        assert_eq!(after_spec["status"]["ok"], json!(true));
    }

    #[tokio::test]
    async fn noop_writes_do_not_bump_versions() {
        let store = InMemoryStore::new();
        let created = store.create("Thing", object("ns", "a")).await.unwrap();
        let again = store.replace("Thing", created.clone()).await.unwrap();
        assert_eq!(
            read_meta(&again).unwrap().resource_version,
            read_meta(&created).unwrap().resource_version
        );
    }

    #[tokio::test]
    async fn delete_with_finalizer_marks_then_drains() {
        let store = InMemoryStore::new();
        let mut obj = object("ns", "a");
        obj["metadata"]["finalizers"] = json!(["test/finalizer"]);
        store.create("Thing", obj).await.unwrap();
        let key = ObjectKey::new("ns", "a");

        store.delete("Thing", &key).await.unwrap();
        let marked = store.get("Thing", &key).await.unwrap().unwrap();
        let mut meta = read_meta(&marked).unwrap();
        assert!(meta.is_deleting());

        meta.remove_finalizer("test/finalizer");
        let mut drained = marked;
        write_meta(&mut drained, &meta).unwrap();
        store.replace("Thing", drained).await.unwrap();
        assert!(store.get("Thing", &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removal_cascades_to_owned_objects() {
        let store = InMemoryStore::new();
        let owner = store.create("Owner", object("ns", "parent")).await.unwrap();
        let owner_uid = read_meta(&owner).unwrap().uid;

        for name in ["child-1", "child-2"] {
            let mut child = object("ns", name);
            child["metadata"]["ownerReferences"] =
                json!([{ "kind": "Owner", "name": "parent", "uid": owner_uid, "controller": true }]);
            store.create("Child", child).await.unwrap();
        }
        store.create("Child", object("ns", "unrelated")).await.unwrap();

        store.delete("Owner", &ObjectKey::new("ns", "parent")).await.unwrap();
        let remaining = store.list("Child", &ListParams::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0]["metadata"]["name"], "unrelated");
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels() {
        let store = InMemoryStore::new();
        let mut labelled = object("ns", "a");
        labelled["metadata"]["labels"] = json!({ "owner": "x" });
        store.create("Thing", labelled).await.unwrap();
        store.create("Thing", object("ns", "b")).await.unwrap();
        store.create("Thing", object("other", "c")).await.unwrap();

        let in_ns = store
            .list("Thing", &ListParams::default().in_namespace("ns"))
            .await
            .unwrap();
        assert_eq!(in_ns.len(), 2);

        let by_label = store
            .list("Thing", &ListParams::default().with_label("owner", "x"))
            .await
            .unwrap();
        assert_eq!(by_label.len(), 1);
    }

    #[tokio::test]
    async fn watch_reports_each_change() {
        let store = InMemoryStore::new();
        let mut rx = store.watch();
        let created = store.create("Thing", object("ns", "a")).await.unwrap();
        let mut changed = created;
        changed["spec"]["value"] = json!(5);
        store.replace("Thing", changed).await.unwrap();
        store.delete("Thing", &ObjectKey::new("ns", "a")).await.unwrap();

        let types: Vec<WatchEventType> = (0..3).map(|_| rx.try_recv().unwrap().event_type).collect();
        assert_eq!(
            types,
            vec![
                WatchEventType::Added,
                WatchEventType::Modified,
                WatchEventType::Deleted
            ]
        );
    }
}
