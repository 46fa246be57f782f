//! Bundle reconciler: detects drift against the mirrored repository and
//! applies manifests, keeping a bounded history of RunRecords.

use async_trait::async_trait;
use kude_common::{
    Api, Bundle, ConditionStatus, ListParams, ObjectKey, ObjectMeta, Resource, RunRecord,
    RunRecordSpec, RunRecordStatus, StoreError, TrackedRepository, is_condition_true,
};
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::apply::{ApplyCommand, ApplyOutcome};
use crate::controller::{Action, Context, ReconcileError, Reconciler};
use crate::ledger::{Baseline, ConditionLedger};
use crate::repository::AVAILABLE;

pub const FINALIZER: &str = "bundles.kude.dev/finalizer";
pub const OWNER_LABEL: &str = "bundles.kude.dev/owner-uid";

pub const UP_TO_DATE: &str = "UpToDate";
pub const DEGRADED: &str = "Degraded";

const BASELINE: [Baseline<'static>; 2] = [
    Baseline {
        type_: UP_TO_DATE,
        status: ConditionStatus::Unknown,
        reason: "Reconciling",
        message: "Initial value",
    },
    Baseline {
        type_: DEGRADED,
        status: ConditionStatus::False,
        reason: "Reconciling",
        message: "Initial value",
    },
];

/// Drift verdict for a Bundle against its source commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    UpToDate,
    Failed,
    OutOfDate,
    NotApplied,
}

impl Drift {
    pub fn evaluate(last_run: Option<&RunRecord>, source_sha: &str) -> Self {
        match last_run {
            None => Self::NotApplied,
            Some(run) if run.spec.commit_sha != source_sha => Self::OutOfDate,
            Some(run) if run.succeeded() => Self::UpToDate,
            Some(_) => Self::Failed,
        }
    }

    fn condition(self) -> (ConditionStatus, &'static str, &'static str) {
        match self {
            Self::UpToDate => (
                ConditionStatus::True,
                "UpToDate",
                "Last run matches current repository SHA",
            ),
            Self::Failed => (ConditionStatus::False, "Failed", "Last run failed, retrying"),
            Self::OutOfDate => (
                ConditionStatus::False,
                "OutOfDate",
                "Last run does not match current repository SHA",
            ),
            Self::NotApplied => (ConditionStatus::False, "NotApplied", "Bundle has no runs yet"),
        }
    }
}

/// Expands file patterns against `dir`, preserving declaration order. A
/// pattern that matches nothing is passed through unchanged.
pub fn expand_files(dir: &Path, patterns: &[String]) -> Vec<String> {
    let mut files = Vec::new();
    for pattern in patterns {
        let full = dir.join(pattern);
        let matches: Vec<String> = match glob::glob(&full.to_string_lossy()) {
            Ok(paths) => paths
                .filter_map(Result::ok)
                .filter_map(|p| p.strip_prefix(dir).ok().map(|r| r.to_string_lossy().into_owned()))
                .collect(),
            Err(err) => {
                debug!(pattern, "not a valid glob: {err}");
                Vec::new()
            }
        };
        if matches.is_empty() {
            files.push(pattern.clone());
        } else {
            files.extend(matches);
        }
    }
    files
}

#[derive(Default)]
pub struct BundleReconciler;

impl BundleReconciler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Reconciler for BundleReconciler {
    fn kind(&self) -> &'static str {
        Bundle::KIND
    }

    async fn reconcile(&self, key: &ObjectKey, ctx: &Context) -> Result<Action, ReconcileError> {
        let api = Api::<Bundle>::new(Arc::clone(&ctx.store));
        let Some(mut bundle) = api.get(key).await? else {
            debug!(key = %key, "bundle no longer exists");
            return Ok(Action::await_change());
        };

        if ConditionLedger::ensure_baseline(&api, &mut bundle, &BASELINE).await? {
            return Ok(Action::requeue());
        }

        if bundle.metadata.is_deleting() {
            if !bundle.metadata.has_finalizer(FINALIZER) {
                return Ok(Action::await_change());
            }
            return finalize(&api, bundle).await;
        }

        if bundle.metadata.add_finalizer(FINALIZER) {
            api.replace(&bundle).await?;
            return Ok(Action::requeue());
        }

        let object = bundle.object_ref();
        let interval = match bundle.spec.interval() {
            Ok(interval) => interval,
            Err(err) => {
                let message = format!(
                    "Invalid drift detection interval: {}",
                    bundle.spec.drift_detection_interval
                );
                if ConditionLedger::set_condition(
                    &api,
                    &mut bundle,
                    UP_TO_DATE,
                    ConditionStatus::Unknown,
                    "InvalidDriftDetectionInterval",
                    &message,
                )
                .await?
                {
                    ctx.recorder
                        .warning(&object, "InvalidDriftDetectionInterval", err.to_string());
                }
                return Ok(Action::await_change());
            }
        };

        let source_key = match bundle.spec.source_key() {
            Ok(key) => key,
            Err(err) => {
                if ConditionLedger::set_condition(
                    &api,
                    &mut bundle,
                    UP_TO_DATE,
                    ConditionStatus::Unknown,
                    "InvalidSourceRepository",
                    &err.to_string(),
                )
                .await?
                {
                    ctx.recorder
                        .warning(&object, "InvalidSourceRepository", err.to_string());
                }
                return Ok(Action::await_change());
            }
        };

        let runs_api = Api::<RunRecord>::new(Arc::clone(&ctx.store));
        let limit = bundle.spec.history_limit();
        let last_run = prune_runs(&runs_api, &bundle, limit, ctx).await?;

        let repos = Api::<TrackedRepository>::new(Arc::clone(&ctx.store));
        let Some(source) = repos.get(&source_key).await? else {
            let message = format!("TrackedRepository {source_key} not found");
            if ConditionLedger::set_condition(
                &api,
                &mut bundle,
                UP_TO_DATE,
                ConditionStatus::Unknown,
                "SourceNotFound",
                &message,
            )
            .await?
            {
                ctx.recorder.warning(&object, "SourceNotFound", message);
            }
            return Ok(Action::requeue_after(interval));
        };

        if !is_condition_true(&source.status.conditions, AVAILABLE)
            || source.status.last_pulled_sha.is_empty()
            || source.status.work_directory.is_empty()
        {
            let message = format!("TrackedRepository {source_key} is not available");
            if ConditionLedger::set_condition(
                &api,
                &mut bundle,
                UP_TO_DATE,
                ConditionStatus::Unknown,
                "SourceNotReady",
                &message,
            )
            .await?
            {
                ctx.recorder.normal(&object, "SourceNotReady", message);
            }
            return Ok(Action::requeue_after(interval));
        }

        let sha = source.status.last_pulled_sha.clone();
        let drift = Drift::evaluate(last_run.as_ref(), &sha);
        let (status, reason, message) = drift.condition();
        let wrote =
            ConditionLedger::set_condition(&api, &mut bundle, UP_TO_DATE, status, reason, message)
                .await?;
        if drift == Drift::UpToDate {
            return Ok(Action::requeue_after(interval));
        }
        if wrote {
            ctx.recorder.normal(&object, reason, message);
            return Ok(Action::requeue());
        }

        // Leave room for the run about to be created.
        prune_runs(&runs_api, &bundle, limit - 1, ctx).await?;

        let workdir = PathBuf::from(&source.status.work_directory);
        let files = expand_files(&workdir, &bundle.spec.files);
        let command = ApplyCommand::apply(
            &ctx.settings.apply_command,
            &bundle.spec.args,
            &files,
            workdir,
        );

        let mut run = match create_run(&runs_api, &bundle, &sha, &command).await {
            Ok(run) => run,
            Err(err) => {
                ctx.recorder
                    .warning(&object, "FailedCreatingRun", format!("Failed to create run: {err}"));
                return Err(err.into());
            }
        };

        let header = format!("$ {}\n", command.command_line());
        info!(bundle = %key, run = %run.metadata.name, sha = %sha, "applying bundle");
        let (status, succeeded) = match command.run(&ctx.shutdown).await {
            ApplyOutcome::FailedToStart(err) => {
                ctx.recorder.warning(
                    &object,
                    "FailedStartingRun",
                    format!("Failed to start run '{}': {err}", run.metadata.name),
                );
                (
                    RunRecordStatus {
                        exit_code: -1,
                        output: header,
                        error: Some(format!("failed to start command: {err}")),
                    },
                    false,
                )
            }
            ApplyOutcome::Completed {
                exit_code,
                output,
                interrupted,
            } => {
                let output = format!("{header}{output}");
                if interrupted {
                    warn!(bundle = %key, run = %run.metadata.name, "apply interrupted by shutdown");
                    (
                        RunRecordStatus {
                            exit_code,
                            output,
                            error: Some("command interrupted: operator shutting down".to_string()),
                        },
                        false,
                    )
                } else if exit_code != 0 {
                    ctx.recorder.warning(
                        &object,
                        "RunFailed",
                        format!("Run '{}' failed with exit code {exit_code}", run.metadata.name),
                    );
                    (
                        RunRecordStatus {
                            exit_code,
                            output,
                            error: Some(format!("command failed: exit status {exit_code}")),
                        },
                        false,
                    )
                } else {
                    ctx.recorder.normal(
                        &object,
                        "RunSucceeded",
                        format!("Run '{}' applied commit {sha}", run.metadata.name),
                    );
                    (
                        RunRecordStatus {
                            exit_code,
                            output,
                            error: None,
                        },
                        true,
                    )
                }
            }
        };

        run.status = Some(status);
        runs_api.replace_status(&run).await?;

        if succeeded {
            let (status, reason, message) = Drift::UpToDate.condition();
            ConditionLedger::set_condition(&api, &mut bundle, UP_TO_DATE, status, reason, message)
                .await?;
        }
        Ok(Action::requeue_after(interval))
    }
}

/// Deletes all but the `keep` newest runs, oldest first, and returns the
/// most recent remaining run.
async fn prune_runs(
    runs_api: &Api<RunRecord>,
    bundle: &Bundle,
    keep: usize,
    ctx: &Context,
) -> Result<Option<RunRecord>, ReconcileError> {
    let params = ListParams::default()
        .in_namespace(bundle.metadata.namespace.clone())
        .with_label(OWNER_LABEL, bundle.metadata.uid.clone());
    let mut runs = runs_api.list(&params).await?;
    runs.sort_by_key(|run| {
        Reverse((
            run.metadata.creation_timestamp,
            run.metadata.name.clone(),
        ))
    });

    if runs.len() > keep {
        let mut pruned = 0usize;
        for run in runs.drain(keep..) {
            match runs_api.delete(&run.key()).await {
                Ok(()) => pruned += 1,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
        if pruned > 0 {
            ctx.recorder.normal(
                &bundle.object_ref(),
                "RunsPruned",
                format!(
                    "Pruned {pruned} run(s) beyond history limit {}",
                    bundle.spec.history_limit()
                ),
            );
        }
    }
    Ok(runs.into_iter().next())
}

async fn create_run(
    runs_api: &Api<RunRecord>,
    bundle: &Bundle,
    sha: &str,
    command: &ApplyCommand,
) -> Result<RunRecord, StoreError> {
    let mut metadata = ObjectMeta::new(
        bundle.metadata.namespace.clone(),
        uuid::Uuid::new_v4().to_string(),
    );
    metadata
        .labels
        .insert(OWNER_LABEL.to_string(), bundle.metadata.uid.clone());
    metadata.owner_references.push(bundle.controller_ref());

    runs_api
        .create(&RunRecord {
            metadata,
            spec: RunRecordSpec {
                commit_sha: sha.to_string(),
                directory: command.directory.to_string_lossy().into_owned(),
                command: command.program.clone(),
                args: command.args.clone(),
            },
            status: None,
        })
        .await
}

async fn finalize(api: &Api<Bundle>, mut bundle: Bundle) -> Result<Action, ReconcileError> {
    if ConditionLedger::set_condition(
        api,
        &mut bundle,
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
        &mut bundle,
        UP_TO_DATE,
        ConditionStatus::Unknown,
        "Deleted",
        "Deleting resource",
    )
    .await?
    {
        return Ok(Action::requeue());
    }
    if bundle.metadata.remove_finalizer(FINALIZER) {
        api.replace(&bundle).await?;
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{bundle as create_bundle, context, context_with_apply, drive, repository};
    use kude_common::{find_condition, set_condition};
    use std::time::Duration;

    const SHA_X: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_Y: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    /// Stores a repository that looks fully mirrored at `sha`.
    async fn ready_source(ctx: &Context, workdir: &Path, sha: &str) -> TrackedRepository {
        let repos = Api::<TrackedRepository>::new(Arc::clone(&ctx.store));
        let mut repo = repository(ctx, "infra", "repo", "https://example.com/repo.git").await;
        repo.status.work_directory = workdir.to_string_lossy().into_owned();
        repo.status.last_pulled_sha = sha.to_string();
        set_condition(
            &mut repo.status.conditions,
            AVAILABLE,
            ConditionStatus::True,
            "Ready",
            "",
            1,
        );
        repos.replace_status(&repo).await.unwrap()
    }

    async fn set_source_sha(ctx: &Context, sha: &str) {
        let repos = Api::<TrackedRepository>::new(Arc::clone(&ctx.store));
        let mut repo = repos.get(&ObjectKey::new("infra", "repo")).await.unwrap().unwrap();
        repo.status.last_pulled_sha = sha.to_string();
        repos.replace_status(&repo).await.unwrap();
    }

    async fn runs(ctx: &Context) -> Vec<RunRecord> {
        let api = Api::<RunRecord>::new(Arc::clone(&ctx.store));
        let mut runs = api.list(&ListParams::default()).await.unwrap();
        runs.sort_by_key(|r| r.metadata.creation_timestamp);
        runs
    }

    async fn runs_len(ctx: &Context) -> usize {
        runs(ctx).await.len()
    }

    async fn up_to_date(ctx: &Context, key: &ObjectKey) -> (ConditionStatus, String) {
        let api = Api::<Bundle>::new(Arc::clone(&ctx.store));
        let bundle = api.get(key).await.unwrap().unwrap();
        let c = find_condition(&bundle.status.conditions, UP_TO_DATE).unwrap();
        (c.status, c.reason.clone())
    }

    fn manifests() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yaml"), "kind: Service\n").unwrap();
        std::fs::write(dir.path().join("a.yaml"), "kind: ConfigMap\n").unwrap();
        dir
    }

    #[test]
    fn drift_verdicts() {
        let mut run = RunRecord {
            metadata: ObjectMeta::new("default", "r"),
            spec: RunRecordSpec {
                commit_sha: SHA_X.to_string(),
                ..RunRecordSpec::default()
            },
            status: None,
        };
        assert_eq!(Drift::evaluate(None, SHA_X), Drift::NotApplied);
        assert_eq!(Drift::evaluate(Some(&run), SHA_X), Drift::Failed);
        run.status = Some(RunRecordStatus::default());
        assert_eq!(Drift::evaluate(Some(&run), SHA_X), Drift::UpToDate);
        assert_eq!(Drift::evaluate(Some(&run), SHA_Y), Drift::OutOfDate);
    }

    #[test]
    fn globs_expand_in_order_and_unmatched_pass_through() {
        let dir = manifests();
        let files = expand_files(
            dir.path(),
            &["*.yaml".to_string(), "missing/*.yml".to_string()],
        );
        assert_eq!(files, vec!["a.yaml", "b.yaml", "missing/*.yml"]);
    }

    #[tokio::test]
    async fn applies_and_becomes_up_to_date() {
        let mirror = manifests();
        let ctx = context(mirror.path().parent().unwrap().to_path_buf());
        ready_source(&ctx, mirror.path(), SHA_X).await;
        let bundle = create_bundle(&ctx, "default", "web", "infra/repo").await;

        let action = drive(&BundleReconciler::new(), &ctx, &bundle.key()).await;
        assert_eq!(action, Action::requeue_after(Duration::from_secs(5)));

        let runs = runs(&ctx).await;
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.spec.commit_sha, SHA_X);
        assert_eq!(run.spec.command, "echo");
        assert_eq!(run.spec.args, vec!["apply", "-f", "a.yaml", "b.yaml"]);
        assert_eq!(run.spec.directory, mirror.path().to_string_lossy());
        let status = run.status.as_ref().unwrap();
        assert_eq!(status.exit_code, 0);
        assert!(status.output.starts_with("$ echo apply -f a.yaml b.yaml\n"));
        assert!(status.output.contains("apply -f a.yaml b.yaml"));
        assert!(run.metadata.labels.contains_key(OWNER_LABEL));
        assert_eq!(run.metadata.owner_references[0].kind, "Bundle");

        assert_eq!(
            up_to_date(&ctx, &bundle.key()).await,
            (ConditionStatus::True, "UpToDate".to_string())
        );

        let api = Api::<Bundle>::new(Arc::clone(&ctx.store));
        let version = api.get(&bundle.key()).await.unwrap().unwrap().metadata.resource_version;
        BundleReconciler::new().reconcile(&bundle.key(), &ctx).await.unwrap();
        assert_eq!(
            api.get(&bundle.key()).await.unwrap().unwrap().metadata.resource_version,
            version
        );
        assert_eq!(runs_len(&ctx).await, 1);
    }

    #[tokio::test]
    async fn new_commit_is_reported_out_of_date_before_running() {
        let mirror = manifests();
        let ctx = context(mirror.path().parent().unwrap().to_path_buf());
        ready_source(&ctx, mirror.path(), SHA_X).await;
        let bundle = create_bundle(&ctx, "default", "web", "infra/repo").await;
        let reconciler = BundleReconciler::new();
        drive(&reconciler, &ctx, &bundle.key()).await;

        set_source_sha(&ctx, SHA_Y).await;
        let action = reconciler.reconcile(&bundle.key(), &ctx).await.unwrap();
        assert_eq!(action, Action::requeue());
        assert_eq!(
            up_to_date(&ctx, &bundle.key()).await,
            (ConditionStatus::False, "OutOfDate".to_string())
        );
        assert_eq!(runs_len(&ctx).await, 1);
        let reasons: Vec<String> = ctx
            .recorder
            .for_object("Bundle", "default", "web")
            .into_iter()
            .map(|e| e.reason)
            .collect();
        assert_eq!(reasons.first().map(String::as_str), Some("NotApplied"));
        assert_eq!(reasons.last().map(String::as_str), Some("OutOfDate"));

        drive(&reconciler, &ctx, &bundle.key()).await;
        let runs = runs(&ctx).await;
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].spec.commit_sha, SHA_Y);
        assert_eq!(up_to_date(&ctx, &bundle.key()).await.0, ConditionStatus::True);
    }

    #[tokio::test]
    async fn failing_apply_is_recorded_and_retried() {
        let mirror = manifests();
        let ctx = context_with_apply(mirror.path().parent().unwrap().to_path_buf(), "false");
        ready_source(&ctx, mirror.path(), SHA_X).await;
        let bundle = create_bundle(&ctx, "default", "web", "infra/repo").await;
        let reconciler = BundleReconciler::new();

        let action = drive(&reconciler, &ctx, &bundle.key()).await;
        assert_eq!(action, Action::requeue_after(Duration::from_secs(5)));
        let first = runs(&ctx).await;
        let status = first[0].status.as_ref().unwrap();
        assert_ne!(status.exit_code, 0);
        assert!(status.error.as_deref().unwrap().starts_with("command failed"));

        let action = reconciler.reconcile(&bundle.key(), &ctx).await.unwrap();
        assert_eq!(action, Action::requeue());
        assert_eq!(
            up_to_date(&ctx, &bundle.key()).await,
            (ConditionStatus::False, "Failed".to_string())
        );
        drive(&reconciler, &ctx, &bundle.key()).await;
        assert_eq!(runs_len(&ctx).await, 2);
        assert!(
            ctx.recorder
                .for_object("Bundle", "default", "web")
                .iter()
                .any(|e| e.reason == "RunFailed")
        );
    }

    #[tokio::test]
    async fn start_failure_records_negative_exit_code() {
        let mirror = manifests();
        let ctx = context_with_apply(
            mirror.path().parent().unwrap().to_path_buf(),
            "/nonexistent/kubectl",
        );
        ready_source(&ctx, mirror.path(), SHA_X).await;
        let bundle = create_bundle(&ctx, "default", "web", "infra/repo").await;

        let action = drive(&BundleReconciler::new(), &ctx, &bundle.key()).await;
        assert_eq!(action, Action::requeue_after(Duration::from_secs(5)));
        let runs = runs(&ctx).await;
        let status = runs[0].status.as_ref().unwrap();
        assert_eq!(status.exit_code, -1);
        assert!(status.error.as_deref().unwrap().starts_with("failed to start command"));
    }

    #[tokio::test]
    async fn history_is_bounded_to_newest_runs() {
        let mirror = manifests();
        let ctx = context(mirror.path().parent().unwrap().to_path_buf());
        ready_source(&ctx, mirror.path(), "0").await;
        let api = Api::<Bundle>::new(Arc::clone(&ctx.store));
        let mut bundle = create_bundle(&ctx, "default", "web", "infra/repo").await;
        bundle.spec.runs_history_limit = Some(2);
        api.replace(&bundle).await.unwrap();
        let reconciler = BundleReconciler::new();

        for sha in ["1", "2", "3", "4"] {
            set_source_sha(&ctx, sha).await;
            let action = drive(&reconciler, &ctx, &bundle.key()).await;
            assert_eq!(action, Action::requeue_after(Duration::from_secs(5)));
            assert!(runs_len(&ctx).await <= 2, "history exceeded after sha {sha}");
        }

        let runs = runs(&ctx).await;
        assert_eq!(runs.len(), 2);
        let shas: Vec<&str> = runs.iter().map(|r| r.spec.commit_sha.as_str()).collect();
        assert_eq!(shas, vec!["3", "4"]);
        assert!(
            ctx.recorder
                .for_object("Bundle", "default", "web")
                .iter()
                .any(|e| e.reason == "RunsPruned")
        );
    }

    #[tokio::test]
    async fn history_of_one_keeps_only_latest_run() {
        let mirror = manifests();
        let ctx = context(mirror.path().parent().unwrap().to_path_buf());
        ready_source(&ctx, mirror.path(), SHA_X).await;
        let api = Api::<Bundle>::new(Arc::clone(&ctx.store));
        let mut bundle = create_bundle(&ctx, "default", "web", "infra/repo").await;
        bundle.spec.runs_history_limit = Some(1);
        api.replace(&bundle).await.unwrap();
        let reconciler = BundleReconciler::new();

        drive(&reconciler, &ctx, &bundle.key()).await;
        set_source_sha(&ctx, SHA_Y).await;
        drive(&reconciler, &ctx, &bundle.key()).await;

        let runs = runs(&ctx).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].spec.commit_sha, SHA_Y);
        assert_eq!(up_to_date(&ctx, &bundle.key()).await.0, ConditionStatus::True);
    }

    #[tokio::test]
    async fn missing_source_waits_for_interval() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path().to_path_buf());
        let bundle = create_bundle(&ctx, "default", "web", "infra/missing").await;

        let action = drive(&BundleReconciler::new(), &ctx, &bundle.key()).await;
        assert_eq!(action, Action::requeue_after(Duration::from_secs(5)));
        assert_eq!(
            up_to_date(&ctx, &bundle.key()).await,
            (ConditionStatus::Unknown, "SourceNotFound".to_string())
        );
        assert_eq!(runs_len(&ctx).await, 0);
    }

    #[tokio::test]
    async fn unready_source_is_never_applied() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path().to_path_buf());
        repository(&ctx, "infra", "repo", "https://example.com/repo.git").await;
        let bundle = create_bundle(&ctx, "default", "web", "infra/repo").await;

        let action = drive(&BundleReconciler::new(), &ctx, &bundle.key()).await;
        assert_eq!(action, Action::requeue_after(Duration::from_secs(5)));
        assert_eq!(
            up_to_date(&ctx, &bundle.key()).await,
            (ConditionStatus::Unknown, "SourceNotReady".to_string())
        );
        assert_eq!(runs_len(&ctx).await, 0);
    }

    #[tokio::test]
    async fn malformed_source_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path().to_path_buf());
        let bundle = create_bundle(&ctx, "default", "web", "no-namespace").await;

        let action = drive(&BundleReconciler::new(), &ctx, &bundle.key()).await;
        assert_eq!(action, Action::await_change());
        assert_eq!(
            up_to_date(&ctx, &bundle.key()).await,
            (ConditionStatus::Unknown, "InvalidSourceRepository".to_string())
        );
        let events = ctx.recorder.for_object("Bundle", "default", "web");
        assert_eq!(
            events
                .iter()
                .filter(|e| e.reason == "InvalidSourceRepository")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn deletion_drains_finalizer_and_collects_runs() {
        let mirror = manifests();
        let ctx = context(mirror.path().parent().unwrap().to_path_buf());
        ready_source(&ctx, mirror.path(), SHA_X).await;
        let bundle = create_bundle(&ctx, "default", "web", "infra/repo").await;
        let reconciler = BundleReconciler::new();
        drive(&reconciler, &ctx, &bundle.key()).await;
        assert_eq!(runs_len(&ctx).await, 1);

        let api = Api::<Bundle>::new(Arc::clone(&ctx.store));
        api.delete(&bundle.key()).await.unwrap();
        let action = drive(&reconciler, &ctx, &bundle.key()).await;
        assert_eq!(action, Action::await_change());

        assert!(api.get(&bundle.key()).await.unwrap().is_none());
        assert_eq!(runs_len(&ctx).await, 0);
    }
}
