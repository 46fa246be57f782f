//! TrackedRepository reconciler: keeps a local mirror of a remote ref.
//!
//! Each pass performs at most one state change and then asks to run again,
//! so every step can be resumed after a restart from persisted status alone.

use async_trait::async_trait;
use kude_common::{
    Api, ConditionStatus, ObjectKey, ObjectReference, Resource, TrackedRepository,
    is_condition_true, parse_interval,
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::controller::{Action, Context, ReconcileError, Reconciler};
use crate::git::{GitRef, ORIGIN, Vcs};
use crate::ledger::{Baseline, ConditionLedger};

pub const FINALIZER: &str = "trackedrepositories.kude.dev/finalizer";

pub const AVAILABLE: &str = "Available";
pub const CLONED: &str = "Cloned";
pub const DEGRADED: &str = "Degraded";

const BASELINE: [Baseline<'static>; 2] = [
    Baseline {
        type_: AVAILABLE,
        status: ConditionStatus::Unknown,
        reason: "Reconciling",
        message: "Initial value",
    },
    Baseline {
        type_: CLONED,
        status: ConditionStatus::Unknown,
        reason: "Reconciling",
        message: "Initial value",
    },
];

pub struct RepositoryReconciler {
    vcs: Arc<dyn Vcs>,
}

impl RepositoryReconciler {
    pub fn new(vcs: Arc<dyn Vcs>) -> Self {
        Self { vcs }
    }
}

/// Expected mirror location for a repository uid.
pub fn mirror_path(root: &Path, uid: &str) -> PathBuf {
    root.join(uid)
}

/// Whether `path` is strictly inside `root` without escaping through `..`.
pub fn is_within_root(root: &Path, path: &Path) -> bool {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return false;
    }
    path != root && path.starts_with(root)
}

#[async_trait]
impl Reconciler for RepositoryReconciler {
    fn kind(&self) -> &'static str {
        TrackedRepository::KIND
    }

    async fn reconcile(&self, key: &ObjectKey, ctx: &Context) -> Result<Action, ReconcileError> {
        let api = Api::<TrackedRepository>::new(Arc::clone(&ctx.store));
        let Some(mut repo) = api.get(key).await? else {
            debug!(key = %key, "repository no longer exists");
            return Ok(Action::await_change());
        };

        if ConditionLedger::ensure_baseline(&api, &mut repo, &BASELINE).await? {
            return Ok(Action::requeue());
        }

        if repo.metadata.is_deleting() {
            if !repo.metadata.has_finalizer(FINALIZER) {
                return Ok(Action::await_change());
            }
            return self.finalize(&api, repo, ctx).await;
        }

        if repo.metadata.add_finalizer(FINALIZER) {
            api.replace(&repo).await?;
            return Ok(Action::requeue());
        }

        let expected = mirror_path(&ctx.settings.mirror_root, &repo.metadata.uid);
        let expected_str = expected.to_string_lossy().into_owned();
        if repo.status.work_directory != expected_str {
            repo.status.work_directory = expected_str;
            api.replace_status(&repo).await?;
            return Ok(Action::requeue());
        }

        let object = repo.object_ref();
        let interval = match parse_interval(&repo.spec.polling_interval) {
            Ok(interval) => interval,
            Err(err) => {
                let message = format!("Invalid polling interval: {}", repo.spec.polling_interval);
                if ConditionLedger::set_condition(
                    &api,
                    &mut repo,
                    AVAILABLE,
                    ConditionStatus::False,
                    "InvalidPollingInterval",
                    &message,
                )
                .await?
                {
                    ctx.recorder
                        .warning(&object, "InvalidPollingInterval", err.to_string());
                }
                return Ok(Action::await_change());
            }
        };

        let git_ref = GitRef::parse(&repo.spec.ref_);
        let workdir = expected;

        match tokio::fs::metadata(&workdir).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return self
                    .clone_mirror(&api, repo, ctx, &object, &git_ref, &workdir, interval)
                    .await;
            }
            Err(err) => {
                let message = format!("Failed to stat clone: {err}");
                if ConditionLedger::set_condition(
                    &api,
                    &mut repo,
                    CLONED,
                    ConditionStatus::Unknown,
                    "CloneInaccessible",
                    &message,
                )
                .await?
                {
                    ctx.recorder.warning(&object, "CloneInaccessible", message);
                    return Ok(Action::requeue());
                }
                if ConditionLedger::set_condition(
                    &api,
                    &mut repo,
                    AVAILABLE,
                    ConditionStatus::False,
                    "CloneInaccessible",
                    &message,
                )
                .await?
                {
                    return Ok(Action::requeue());
                }
                return Ok(Action::requeue_after(interval));
            }
            Ok(_) => {}
        }

        if let Err(err) = self.vcs.open(&workdir).await {
            let message = format!("Clone open failed: {err}");
            if ConditionLedger::set_condition(
                &api,
                &mut repo,
                CLONED,
                ConditionStatus::Unknown,
                "CloneOpenFailed",
                &message,
            )
            .await?
            {
                ctx.recorder.warning(&object, "CloneOpenFailed", message);
            }
            return Ok(Action::requeue_after(interval));
        }

        let urls = match self.vcs.remote_urls(&workdir, ORIGIN).await {
            Ok(urls) => urls,
            Err(err) => {
                let message = format!("Remote lookup failed: {err}");
                if ConditionLedger::set_condition(
                    &api,
                    &mut repo,
                    AVAILABLE,
                    ConditionStatus::False,
                    "RemoteLookupFailed",
                    &message,
                )
                .await?
                {
                    ctx.recorder.warning(&object, "RemoteLookupFailed", message);
                }
                return Ok(Action::requeue_after(interval));
            }
        };
        if urls.len() != 1 {
            let message = format!("Expected 1 URL, found: {urls:?}");
            if ConditionLedger::set_condition(
                &api,
                &mut repo,
                AVAILABLE,
                ConditionStatus::False,
                "InvalidRemote",
                &message,
            )
            .await?
            {
                ctx.recorder.warning(&object, "InvalidRemote", message);
            }
            return Ok(Action::requeue_after(interval));
        }
        if urls[0] != repo.spec.url {
            let message = format!("URL changed from '{}' to '{}'", urls[0], repo.spec.url);
            ConditionLedger::set_condition(
                &api,
                &mut repo,
                AVAILABLE,
                ConditionStatus::False,
                "URLChanged",
                &message,
            )
            .await?;
            ConditionLedger::set_condition(
                &api,
                &mut repo,
                CLONED,
                ConditionStatus::Unknown,
                "URLChanged",
                &message,
            )
            .await?;
            ctx.recorder.normal(&object, "URLChanged", message);
            remove_mirror(&workdir)
                .await
                .map_err(|e| ReconcileError::io(format!("failed deleting clone at {}", workdir.display()), e))?;
            return Ok(Action::requeue());
        }

        if ConditionLedger::set_condition(
            &api,
            &mut repo,
            CLONED,
            ConditionStatus::True,
            "Cloned",
            "",
        )
        .await?
        {
            return Ok(Action::requeue());
        }

        if let Err(err) = self.vcs.fetch(&workdir).await {
            return self
                .sync_failed(&api, repo, ctx, &object, "RemoteFetchFailed", "Failed to fetch remote", err, interval)
                .await;
        }
        if let Err(err) = self.vcs.checkout(&workdir, &git_ref).await {
            return self
                .sync_failed(&api, repo, ctx, &object, "CheckoutFailed", "Failed to checkout ref", err, interval)
                .await;
        }
        if let Err(err) = self.vcs.pull(&workdir, &git_ref).await {
            return self
                .sync_failed(&api, repo, ctx, &object, "PullFailed", "Failed to pull ref", err, interval)
                .await;
        }
        let head = match self.vcs.head(&workdir).await {
            Ok(head) => head,
            Err(err) => {
                return self
                    .sync_failed(&api, repo, ctx, &object, "HeadReadFailed", "Failed to read HEAD", err, interval)
                    .await;
            }
        };

        if repo.status.last_pulled_sha != head {
            let previous = std::mem::replace(&mut repo.status.last_pulled_sha, head.clone());
            api.replace_status(&repo).await?;
            let message = if previous.is_empty() {
                format!("Pulled {head}")
            } else {
                format!("Pulled {head} (was {previous})")
            };
            ctx.recorder.normal(&object, "Pulled", message);
            return Ok(Action::requeue());
        }

        if !is_condition_true(&repo.status.conditions, AVAILABLE) {
            ConditionLedger::set_condition(
                &api,
                &mut repo,
                AVAILABLE,
                ConditionStatus::True,
                "Ready",
                "",
            )
            .await?;
            info!(key = %key, sha = %head, "repository ready");
        }
        Ok(Action::requeue_after(interval))
    }
}

impl RepositoryReconciler {
    #[allow(clippy::too_many_arguments)]
    async fn clone_mirror(
        &self,
        api: &Api<TrackedRepository>,
        mut repo: TrackedRepository,
        ctx: &Context,
        object: &ObjectReference,
        git_ref: &GitRef,
        workdir: &Path,
        interval: std::time::Duration,
    ) -> Result<Action, ReconcileError> {
        if ConditionLedger::set_condition(api, &mut repo, CLONED, ConditionStatus::False, "NotCloned", "")
            .await?
        {
            return Ok(Action::requeue());
        }
        if ConditionLedger::set_condition(api, &mut repo, AVAILABLE, ConditionStatus::False, "NotCloned", "")
            .await?
        {
            return Ok(Action::requeue());
        }
        if !repo.status.last_pulled_sha.is_empty() {
            repo.status.last_pulled_sha.clear();
            api.replace_status(&repo).await?;
            return Ok(Action::requeue());
        }

        tokio::fs::create_dir_all(&ctx.settings.mirror_root)
            .await
            .map_err(|e| {
                ReconcileError::io(
                    format!("failed to create mirror root {}", ctx.settings.mirror_root.display()),
                    e,
                )
            })?;

        match self.vcs.clone_repo(&repo.spec.url, git_ref, workdir).await {
            Ok(()) => {
                ctx.recorder.normal(
                    object,
                    "Cloned",
                    format!("Cloned {} at {} into {}", repo.spec.url, repo.spec.ref_, workdir.display()),
                );
                Ok(Action::requeue())
            }
            Err(err) => {
                ctx.recorder
                    .warning(object, "CloneFailed", format!("Failed to clone repository: {err}"));
                if let Err(cleanup) = remove_mirror(workdir).await {
                    ctx.recorder.warning(
                        object,
                        "CleanupError",
                        format!(
                            "Failed to remove failed clone directory at '{}': {cleanup}",
                            workdir.display()
                        ),
                    );
                }
                Ok(Action::requeue_after(interval))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_failed(
        &self,
        api: &Api<TrackedRepository>,
        mut repo: TrackedRepository,
        ctx: &Context,
        object: &ObjectReference,
        reason: &str,
        summary: &str,
        err: crate::git::VcsError,
        interval: std::time::Duration,
    ) -> Result<Action, ReconcileError> {
        let message = format!("{summary}: {err}");
        ConditionLedger::set_condition(api, &mut repo, AVAILABLE, ConditionStatus::False, reason, &message)
            .await?;
        ctx.recorder.warning(object, reason, message);
        Ok(Action::requeue_after(interval))
    }

    async fn finalize(
        &self,
        api: &Api<TrackedRepository>,
        mut repo: TrackedRepository,
        ctx: &Context,
    ) -> Result<Action, ReconcileError> {
        let object = repo.object_ref();
        if ConditionLedger::set_condition(
            api,
            &mut repo,
            DEGRADED,
            ConditionStatus::True,
            "Deleted",
            "Deleting resource",
        )
        .await?
        {
            return Ok(Action::requeue());
        }
        if ConditionLedger::set_condition(
            api,
            &mut repo,
            AVAILABLE,
            ConditionStatus::False,
            "Deleted",
            "Deleting resource",
        )
        .await?
        {
            return Ok(Action::requeue());
        }

        if !repo.status.work_directory.is_empty() {
            let root = &ctx.settings.mirror_root;
            let workdir = PathBuf::from(&repo.status.work_directory);
            if !is_within_root(root, &workdir) {
                ctx.recorder.warning(
                    &object,
                    "InvalidWorkDirectory",
                    format!(
                        "Work directory '{}' is not under {}/",
                        repo.status.work_directory,
                        root.display()
                    ),
                );
                return Ok(Action::await_change());
            }
            if let Err(err) = remove_mirror(&workdir).await {
                ctx.recorder.warning(
                    &object,
                    "CleanupError",
                    format!("Failed to delete mirror at '{}': {err}", workdir.display()),
                );
                return Err(ReconcileError::io(
                    format!("failed to delete mirror at {}", workdir.display()),
                    err,
                ));
            }
            ctx.recorder.normal(
                &object,
                "MirrorDeleted",
                format!("Deleted mirror at {}", workdir.display()),
            );
            repo.status.work_directory.clear();
            repo = api.replace_status(&repo).await?;
        }

        ConditionLedger::set_condition(
            api,
            &mut repo,
            CLONED,
            ConditionStatus::False,
            "CloneDeleted",
            "",
        )
        .await?;

        if repo.metadata.remove_finalizer(FINALIZER) {
            api.replace(&repo).await?;
        }
        Ok(Action::await_change())
    }
}

async fn remove_mirror(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
