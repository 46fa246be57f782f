//! Routes store watch events onto the per-kind work queues.

use kude_common::{
    Api, Bundle, ListParams, Resource, RunRecord, StoreError, TrackedRepository, WatchEvent,
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{Context, WorkQueue};

#[derive(Clone)]
pub struct Queues {
    pub repositories: Arc<WorkQueue>,
    pub bundles: Arc<WorkQueue>,
}

/// Rebuilds the source index from every stored Bundle.
async fn refresh_index(ctx: &Context) -> Result<Vec<Bundle>, StoreError> {
    let bundles = Api::<Bundle>::new(Arc::clone(&ctx.store))
        .list(&ListParams::default())
        .await?;
    ctx.index.rebuild(&bundles);
    Ok(bundles)
}

/// Enqueues every existing object once and builds the index.
pub async fn prime(ctx: &Context, queues: &Queues) -> Result<(), StoreError> {
    let repositories = Api::<TrackedRepository>::new(Arc::clone(&ctx.store))
        .list(&ListParams::default())
        .await?;
    let bundles = refresh_index(ctx).await?;
    info!(
        repositories = repositories.len(),
        bundles = bundles.len(),
        "enqueueing existing objects"
    );
    for repo in &repositories {
        queues.repositories.enqueue(repo.key());
    }
    for bundle in &bundles {
        queues.bundles.enqueue(bundle.key());
    }
    Ok(())
}

/// Applies one watch event to the queues.
pub async fn route(ctx: &Context, queues: &Queues, event: &WatchEvent) -> Result<(), StoreError> {
    match event.kind.as_str() {
        TrackedRepository::KIND => {
            queues.repositories.enqueue(event.key.clone());
            for dependent in ctx.index.dependents(&event.key) {
                queues.bundles.enqueue(dependent);
            }
        }
        Bundle::KIND => {
            refresh_index(ctx).await?;
            queues.bundles.enqueue(event.key.clone());
        }
        RunRecord::KIND => {}
        other => debug!(kind = other, "ignoring watch event for unknown kind"),
    }
    Ok(())
}

/// Consumes watch events until `shutdown` fires. A lagging receiver
/// resynchronizes by priming again.
pub async fn run(
    ctx: Arc<Context>,
    queues: Queues,
    mut events: broadcast::Receiver<WatchEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            received = events.recv() => received,
            _ = shutdown.cancelled() => break,
        };
        let result = match received {
            Ok(event) => route(&ctx, &queues, &event).await,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "watch stream lagged, resynchronizing");
                prime(&ctx, &queues).await
            }
            Err(RecvError::Closed) => break,
        };
        if let Err(err) = result {
            warn!("watch routing failed: {err}");
        }
    }
    debug!("watch router stopped");
}
