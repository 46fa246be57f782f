//! Dispatch runtime: per-kind work queues driving reconcilers.
//!
//! Keys are serialized (never reconciled twice at once), duplicates coalesce
//! to the earliest requested time, and hard failures back off exponentially
//! per key until a pass succeeds.

use async_trait::async_trait;
use kude_common::{ObjectKey, ObjectReference, ObjectStore, StoreError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::events::EventRecorder;
use crate::index::SourceIndex;

pub const BACKOFF_BASE: Duration = Duration::from_millis(5);
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);

// ── Reconciler contract ────────────────────────────────────────────────────

/// What the dispatcher should do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Nothing to do until the object changes.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Run again right away.
    pub fn requeue() -> Self {
        Self {
            requeue_after: Some(Duration::ZERO),
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        self.requeue_after
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ReconcileError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Operator-wide settings the reconcilers need.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mirror_root: PathBuf,
    pub apply_command: String,
}

/// Shared state handed to every reconciliation pass.
pub struct Context {
    pub store: Arc<dyn ObjectStore>,
    pub recorder: Arc<EventRecorder>,
    pub index: Arc<SourceIndex>,
    pub settings: Settings,
    /// Cancelled on shutdown; bounds external processes.
    pub shutdown: CancellationToken,
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey, ctx: &Context) -> Result<Action, ReconcileError>;
}

// ── Work queue ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    /// Earliest time each key should run.
    pending: BTreeMap<ObjectKey, Instant>,
    in_flight: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
}

enum Next {
    Ready(ObjectKey),
    WaitUntil(Option<Instant>),
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, key: ObjectKey) {
        self.enqueue_at(key, Instant::now());
    }

    pub fn enqueue_after(&self, key: ObjectKey, delay: Duration) {
        self.enqueue_at(key, Instant::now() + delay);
    }

    fn enqueue_at(&self, key: ObjectKey, at: Instant) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .pending
                .entry(key)
                .and_modify(|existing| *existing = (*existing).min(at))
                .or_insert(at);
        }
        self.notify.notify_one();
    }

    /// Number of keys waiting to run.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn is_in_flight(&self, key: &ObjectKey) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .in_flight
            .contains(key)
    }

    fn next(&self) -> Next {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let candidate = state
            .pending
            .iter()
            .filter(|(key, _)| !state.in_flight.contains(*key))
            .min_by_key(|(_, at)| **at)
            .map(|(key, at)| (key.clone(), *at));

        match candidate {
            Some((key, at)) if at <= now => {
                state.pending.remove(&key);
                state.in_flight.insert(key.clone());
                Next::Ready(key)
            }
            Some((_, at)) => Next::WaitUntil(Some(at)),
            None => Next::WaitUntil(None),
        }
    }

    /// Marks `key` done and schedules its follow-up.
    fn finish(&self, key: &ObjectKey, outcome: &Result<Action, ReconcileError>) -> Option<Duration> {
        let delay = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.in_flight.remove(key);
            match outcome {
                Ok(action) => {
                    state.failures.remove(key);
                    action.delay()
                }
                Err(_) => {
                    let failures = state.failures.entry(key.clone()).or_insert(0);
                    *failures = failures.saturating_add(1);
                    Some(backoff(*failures))
                }
            }
        };
        match delay {
            Some(delay) => self.enqueue_after(key.clone(), delay),
            None => self.notify.notify_one(),
        }
        delay
    }
}

/// Exponential backoff for the `failures`-th consecutive error.
pub fn backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    BACKOFF_BASE
        .checked_mul(1u32 << exponent)
        .map_or(BACKOFF_CAP, |d| d.min(BACKOFF_CAP))
}

// ── Controller ─────────────────────────────────────────────────────────────

pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    ctx: Arc<Context>,
    queue: Arc<WorkQueue>,
    concurrency: usize,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: R, ctx: Arc<Context>, concurrency: usize) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            ctx,
            queue: Arc::new(WorkQueue::new()),
            concurrency: concurrency.max(1),
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Drives the queue until `shutdown` is cancelled, then waits for the
    /// passes still in flight (they observe the same token).
    pub async fn run(self, shutdown: CancellationToken) {
        let kind = self.reconciler.kind();
        info!(kind, concurrency = self.concurrency, "controller started");
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut passes = JoinSet::new();

        loop {
            while let Some(joined) = passes.try_join_next() {
                if let Err(e) = joined {
                    warn!(kind, "reconcile pass ended abnormally: {}", e);
                }
            }

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let key = loop {
                match self.queue.next() {
                    Next::Ready(key) => break Some(key),
                    Next::WaitUntil(deadline) => {
                        let sleep = async {
                            match deadline {
                                Some(at) => tokio::time::sleep_until(at).await,
                                None => std::future::pending::<()>().await,
                            }
                        };
                        tokio::select! {
                            _ = self.queue.notify.notified() => {}
                            _ = sleep => {}
                            _ = shutdown.cancelled() => break None,
                        }
                    }
                }
            };
            let Some(key) = key else {
                break;
            };

            let reconciler = Arc::clone(&self.reconciler);
            let ctx = Arc::clone(&self.ctx);
            let queue = Arc::clone(&self.queue);
            let span = info_span!("reconcile", kind, key = %key);
            passes.spawn(
                async move {
                    let outcome = reconciler.reconcile(&key, &ctx).await;
                    if let Err(err) = &outcome {
                        report_failure(&ctx, kind, &key, err).await;
                    }
                    let next = queue.finish(&key, &outcome);
                    debug!(ok = outcome.is_ok(), ?next, "pass finished");
                    drop(permit);
                }
                .instrument(span),
            );
        }

        if !passes.is_empty() {
            debug!(kind, in_flight = passes.len(), "waiting for in-flight passes");
        }
        while let Some(joined) = passes.join_next().await {
            if let Err(e) = joined {
                warn!(kind, "reconcile pass ended abnormally: {}", e);
            }
        }
        info!(kind, "controller stopped");
    }
}

async fn report_failure(ctx: &Context, kind: &'static str, key: &ObjectKey, err: &ReconcileError) {
    warn!(kind, key = %key, "reconcile failed: {err}");
    let uid = match ctx.store.get(kind, key).await {
        Ok(Some(object)) => object["metadata"]["uid"].as_str().unwrap_or_default().to_string(),
        _ => String::new(),
    };
    let object = ObjectReference {
        kind: kind.to_string(),
        namespace: key.namespace.clone(),
        name: key.name.clone(),
        uid,
    };
    ctx.recorder.warning(&object, "ReconcileFailed", err.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(5));
        assert_eq!(backoff(2), Duration::from_millis(10));
        assert_eq!(backoff(4), Duration::from_millis(40));
        assert_eq!(backoff(30), BACKOFF_CAP);
        assert_eq!(backoff(u32::MAX), BACKOFF_CAP);
    }

    #[tokio::test]
    async fn duplicate_keys_coalesce() {
        let queue = WorkQueue::new();
        let key = ObjectKey::new("default", "a");
        queue.enqueue_after(key.clone(), Duration::from_secs(60));
        queue.enqueue(key.clone());
        queue.enqueue(key.clone());
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.next(), Next::Ready(k) if k == key));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn in_flight_keys_are_not_handed_out_twice() {
        let queue = WorkQueue::new();
        let key = ObjectKey::new("default", "a");
        queue.enqueue(key.clone());
        assert!(matches!(queue.next(), Next::Ready(_)));

        queue.enqueue(key.clone());
        assert!(matches!(queue.next(), Next::WaitUntil(None)));
        assert!(queue.is_in_flight(&key));

        queue.finish(&key, &Ok(Action::await_change()));
        assert!(matches!(queue.next(), Next::Ready(k) if k == key));
    }

    #[tokio::test]
    async fn failures_back_off_and_success_resets() {
        let queue = WorkQueue::new();
        let key = ObjectKey::new("default", "a");
        let err = || Err(ReconcileError::Store(StoreError::invalid("boom")));

        queue.enqueue(key.clone());
        queue.next();
        assert_eq!(queue.finish(&key, &err()), Some(Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.next();
        assert_eq!(queue.finish(&key, &err()), Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.next();
        assert_eq!(queue.finish(&key, &Ok(Action::await_change())), None);
        queue.enqueue(key.clone());
        queue.next();
        assert_eq!(queue.finish(&key, &err()), Some(Duration::from_millis(5)));
    }

    struct Counting {
        passes: Arc<AtomicUsize>,
        concurrent: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reconciler for Counting {
        fn kind(&self) -> &'static str {
            "Counting"
        }

        async fn reconcile(&self, _key: &ObjectKey, _ctx: &Context) -> Result<Action, ReconcileError> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
            if pass == 1 {
                Ok(Action::requeue())
            } else {
                Ok(Action::await_change())
            }
        }
    }

    #[tokio::test]
    async fn controller_serializes_a_key_and_honours_requeue() {
        let dir = tempfile::tempdir().unwrap();
        let passes = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let controller = Controller::new(
            Counting {
                passes: Arc::clone(&passes),
                concurrent: Arc::new(AtomicUsize::new(0)),
                max_concurrent: Arc::clone(&max_concurrent),
            },
            context(dir.path().to_path_buf()),
            4,
        );
        let queue = controller.queue();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(controller.run(shutdown.clone()));

        let key = ObjectKey::new("default", "a");
        for _ in 0..5 {
            queue.enqueue(key.clone());
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
        let total = passes.load(Ordering::SeqCst);
        assert!((2..=3).contains(&total), "unexpected pass count {total}");
    }

    /// Finishes only after shutdown, recording that it got to write its result.
    struct Lingering {
        started: Arc<Notify>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reconciler for Lingering {
        fn kind(&self) -> &'static str {
            "Lingering"
        }

        async fn reconcile(&self, _key: &ObjectKey, ctx: &Context) -> Result<Action, ReconcileError> {
            self.started.notify_one();
            ctx.shutdown.cancelled().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(Action::await_change())
        }
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_passes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path().to_path_buf());
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let controller = Controller::new(
            Lingering {
                started: Arc::clone(&started),
                finished: Arc::clone(&finished),
            },
            Arc::clone(&ctx),
            2,
        );
        controller.queue().enqueue(ObjectKey::new("default", "a"));
        let handle = tokio::spawn(controller.run(ctx.shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), started.notified())
            .await
            .expect("pass never started");
        ctx.shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
