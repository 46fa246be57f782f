//! Shared fixtures for reconciler tests.

use kude_common::{
    Api, Bundle, BundleSpec, InMemoryStore, ObjectKey, TrackedRepository, TrackedRepositorySpec,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::controller::{Action, Context, Reconciler, Settings};
use crate::events::{EventBus, EventRecorder};
use crate::index::SourceIndex;

pub fn context(mirror_root: PathBuf) -> Arc<Context> {
    context_with_apply(mirror_root, "echo")
}

pub fn context_with_apply(mirror_root: PathBuf, apply_command: &str) -> Arc<Context> {
    Arc::new(Context {
        store: Arc::new(InMemoryStore::new()),
        recorder: Arc::new(EventRecorder::new(1024, EventBus::new(1))),
        index: Arc::new(SourceIndex::new()),
        settings: Settings {
            mirror_root,
            apply_command: apply_command.to_string(),
        },
        shutdown: CancellationToken::new(),
    })
}

pub async fn repository(ctx: &Context, namespace: &str, name: &str, url: &str) -> TrackedRepository {
    let api = Api::<TrackedRepository>::new(Arc::clone(&ctx.store));
    api.create(&TrackedRepository::new(
        namespace,
        name,
        TrackedRepositorySpec {
            url: url.to_string(),
            ref_: "main".to_string(),
            polling_interval: "5s".to_string(),
        },
    ))
    .await
    .expect("create repository")
}

pub async fn bundle(ctx: &Context, namespace: &str, name: &str, source: &str) -> Bundle {
    let api = Api::<Bundle>::new(Arc::clone(&ctx.store));
    api.create(&Bundle::new(
        namespace,
        name,
        BundleSpec {
            files: vec!["*.yaml".to_string()],
            args: Vec::new(),
            source_repository: source.to_string(),
            drift_detection_interval: "5s".to_string(),
            runs_history_limit: None,
        },
    ))
    .await
    .expect("create bundle")
}

/// Runs passes back to back while the reconciler asks for an immediate
/// requeue, returning the first other action.
pub async fn drive<R: Reconciler>(reconciler: &R, ctx: &Context, key: &ObjectKey) -> Action {
    for _ in 0..50 {
        let action = reconciler.reconcile(key, ctx).await.expect("reconcile pass");
        if action != Action::requeue() {
            return action;
        }
    }
    panic!("{key} did not settle within 50 passes");
}
