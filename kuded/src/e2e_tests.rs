//! End-to-end runs of both controllers against a real git upstream.
//!
//! Skipped when `git` is not on PATH.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kude_common::{
    Api, Bundle, ConditionStatus, ListParams, ObjectKey, Resource, RunRecord, TrackedRepository,
    TrackedRepositorySpec, find_condition, is_condition_true,
};

use crate::bundle::UP_TO_DATE;
use crate::controller::Context;
use crate::git::GitCli;
use crate::git::test_support::{commit_change, git_available, init_upstream};
use crate::repository::AVAILABLE;
use crate::start_operator;
use crate::testing::{bundle, context};

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn successful_run_for(ctx: &Context, sha: &str) -> bool {
    Api::<RunRecord>::new(Arc::clone(&ctx.store))
        .list(&ListParams::default())
        .await
        .unwrap()
        .iter()
        .any(|run| run.spec.commit_sha == sha && run.succeeded())
}

async fn gone<K: Resource>(ctx: &Context, key: &ObjectKey) -> bool {
    Api::<K>::new(Arc::clone(&ctx.store))
        .get(key)
        .await
        .unwrap()
        .is_none()
}

async fn bundle_up_to_date(ctx: &Context, key: &ObjectKey) -> bool {
    Api::<Bundle>::new(Arc::clone(&ctx.store))
        .get(key)
        .await
        .unwrap()
        .and_then(|b| find_condition(&b.status.conditions, UP_TO_DATE).map(|c| c.status))
        == Some(ConditionStatus::True)
}

async fn create_repository(ctx: &Context, upstream: &Path) -> TrackedRepository {
    Api::<TrackedRepository>::new(Arc::clone(&ctx.store))
        .create(&TrackedRepository::new(
            "infra",
            "repo",
            TrackedRepositorySpec {
                url: upstream.to_string_lossy().into_owned(),
                ref_: "main".to_string(),
                polling_interval: "1s".to_string(),
            },
        ))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirrors_applies_and_follows_new_commits() {
    if !git_available() {
        eprintln!("skipping: git not available");
        return;
    }
    let upstream = tempfile::tempdir().unwrap();
    let first = init_upstream(upstream.path());
    let root = tempfile::tempdir().unwrap();

    let ctx = context(root.path().to_path_buf());
    let tasks = start_operator(
        Arc::clone(&ctx),
        Arc::new(GitCli::new("git", Duration::from_secs(60))),
        2,
    )
    .await
    .unwrap();

    let repo = create_repository(&ctx, upstream.path()).await.key();
    let app = bundle(&ctx, "default", "app", "infra/repo").await.key();

    eventually("first commit applied", || successful_run_for(&ctx, &first)).await;

    let repos = Api::<TrackedRepository>::new(Arc::clone(&ctx.store));
    let mirrored = repos.get(&repo).await.unwrap().unwrap();
    assert_eq!(mirrored.status.last_pulled_sha, first);
    assert!(is_condition_true(&mirrored.status.conditions, AVAILABLE));
    let workdir = root.path().join(&mirrored.metadata.uid);
    assert_eq!(mirrored.status.work_directory, workdir.to_string_lossy());
    assert!(workdir.join("app.yaml").exists());

    eventually("bundle up to date", || bundle_up_to_date(&ctx, &app)).await;

    let second = commit_change(upstream.path(), "app.yaml", "kind: Secret\n");
    eventually("new commit applied", || successful_run_for(&ctx, &second)).await;

    Api::<Bundle>::new(Arc::clone(&ctx.store))
        .delete(&app)
        .await
        .unwrap();
    eventually("bundle finalized", || gone::<Bundle>(&ctx, &app)).await;
    let runs = Api::<RunRecord>::new(Arc::clone(&ctx.store))
        .list(&ListParams::default())
        .await
        .unwrap();
    assert!(runs.is_empty());

    repos.delete(&repo).await.unwrap();
    eventually("repository finalized", || gone::<TrackedRepository>(&ctx, &repo)).await;
    assert!(!workdir.exists());

    ctx.shutdown.cancel();
    for task in tasks {
        task.await.unwrap();
    }
}
