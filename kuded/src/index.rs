//! Reverse index from a TrackedRepository to the Bundles that reference it.

use kude_common::{Bundle, ObjectKey, Resource};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use tracing::debug;

#[derive(Default)]
pub struct SourceIndex {
    entries: RwLock<BTreeMap<ObjectKey, BTreeSet<ObjectKey>>>,
}

impl SourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole index with one computed from `bundles`. Bundles
    /// with a malformed source reference are not indexed.
    pub fn rebuild(&self, bundles: &[Bundle]) {
        let mut entries: BTreeMap<ObjectKey, BTreeSet<ObjectKey>> = BTreeMap::new();
        for bundle in bundles {
            if let Ok(source) = bundle.spec.source_key() {
                entries.entry(source).or_default().insert(bundle.key());
            }
        }
        debug!(sources = entries.len(), bundles = bundles.len(), "source index rebuilt");
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = entries;
    }

    /// Bundle keys referencing `source`, sorted.
    pub fn dependents(&self, source: &ObjectKey) -> Vec<ObjectKey> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}
