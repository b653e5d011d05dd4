//! Workflow generators: the reconciliation side of the engine.
//!
//! Generators compare tracked desired state against observed storage state
//! and emit corrective workflows. They never mutate step state; submissions
//! travel over a bounded channel into the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::storage::{StorageEventKind, StorageHandler};
use crate::store::TrackedItemStore;
use mediarelay_model::{ItemId, StorageId, WorkStep, WorkStepAction};

pub mod local_ingest;
pub mod watch_folder;

pub use local_ingest::LocalIngestGenerator;
pub use watch_folder::WatchFolderGenerator;

pub(crate) const COPY_STEP_PRIORITY: f64 = 2.0;
pub(crate) const DELETE_STEP_PRIORITY: f64 = 2.0;

/// One configured source/destination pairing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSpec {
    pub source: StorageId,
    pub target: StorageId,
    /// Include this flow in the periodic reconciliation audit.
    #[serde(default)]
    pub cron: bool,
}

/// Post-processing chain emitted for every observed file, at descending
/// priorities so scans advance ahead of previews.
pub(crate) fn ingest_steps(name: &ItemId) -> Vec<WorkStep> {
    vec![
        WorkStep::new(WorkStepAction::Scan, name.clone(), 1.0),
        WorkStep::new(WorkStepAction::GenerateMetadata, name.clone(), 0.75),
        WorkStep::new(WorkStepAction::GenerateThumbnail, name.clone(), 0.5),
        WorkStep::new(WorkStepAction::GeneratePreview, name.clone(), 0.3),
    ]
}

/// A generator observing one storage. The shared event loop and sweep below
/// drive implementations through this seam.
#[async_trait]
pub trait StorageObserver: Send + Sync {
    fn storage(&self) -> Arc<dyn StorageHandler>;

    fn tracked(&self) -> Arc<dyn TrackedItemStore>;

    /// A file exists on the storage (live add/change or synthesized add).
    async fn on_file_present(&self, name: &ItemId, kind: StorageEventKind) -> Result<()>;

    /// A file stopped existing (live delete or sweep purge). Implementations
    /// drop the tracked record and emit any implied cleanup workflows.
    async fn on_file_deleted(&self, name: &ItemId) -> Result<()>;

    /// A tracked record outlived its linger window without being refreshed.
    /// Same cleanup as a deletion unless overridden.
    async fn on_item_expired(&self, name: &ItemId) -> Result<()> {
        self.on_file_deleted(name).await
    }

    /// Periodic audit pass. Returns the number of corrective workflows
    /// emitted.
    async fn audit(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Initial reconciliation sweep: refresh `lastSeen` for every tracked file
/// still present, synthesize adds for untracked files, then purge records
/// not re-observed this pass (mark-and-sweep).
pub async fn run_initial_sweep(observer: &dyn StorageObserver) -> Result<usize> {
    let storage = observer.storage();
    let tracked = observer.tracked();
    let storage_id = storage.storage_id().clone();
    let sweep_start = Utc::now();

    let files = storage.list_all_files().await?;
    let mut synthesized = 0usize;
    for file in files {
        let existing = tracked.get_by_id(&file.name).await?;
        match existing {
            Some(item) if item.source_storage_id == storage_id => {
                tracked
                    .upsert(
                        &file.name,
                        Box::new(|existing| {
                            existing.map(|mut item| {
                                item.refresh(Utc::now());
                                item
                            })
                        }),
                    )
                    .await?;
            }
            _ => {
                if let Err(err) = observer
                    .on_file_present(&file.name, StorageEventKind::Add)
                    .await
                {
                    warn!(
                        target: "relay::generator",
                        storage = %storage_id,
                        file = %file.name,
                        error = %err,
                        "sweep add failed"
                    );
                    continue;
                }
                synthesized += 1;
            }
        }
    }

    // anything not re-observed this pass is presumed deleted while unobserved
    for item in tracked.get_all_from_storage(&storage_id).await? {
        if item.last_seen < sweep_start {
            if let Err(err) = observer.on_file_deleted(&item.id).await {
                warn!(
                    target: "relay::generator",
                    storage = %storage_id,
                    file = %item.id,
                    error = %err,
                    "sweep purge failed"
                );
            }
        }
    }

    info!(
        target: "relay::generator",
        storage = %storage_id,
        synthesized,
        "initial reconciliation sweep completed"
    );
    Ok(synthesized)
}

/// Event loop shared by all generators: initial sweep, then react to storage
/// events until shutdown. A lagged event stream triggers a fresh sweep, since
/// mark-and-sweep recovers whatever the stream dropped.
pub async fn run_event_loop(observer: Arc<dyn StorageObserver>, shutdown: CancellationToken) {
    let storage = observer.storage();
    let storage_id = storage.storage_id().clone();
    let mut events = storage.subscribe();

    if let Err(err) = run_initial_sweep(observer.as_ref()).await {
        warn!(
            target: "relay::generator",
            storage = %storage_id,
            error = %err,
            "initial sweep failed"
        );
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(
                    target: "relay::generator",
                    storage = %storage_id,
                    "generator shutting down"
                );
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let outcome = match event.kind {
                        StorageEventKind::Add | StorageEventKind::Change => {
                            observer.on_file_present(&event.name, event.kind).await
                        }
                        StorageEventKind::Delete => observer.on_file_deleted(&event.name).await,
                    };
                    if let Err(err) = outcome {
                        warn!(
                            target: "relay::generator",
                            storage = %storage_id,
                            file = %event.name,
                            error = %err,
                            "storage event handling failed"
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "relay::generator",
                        storage = %storage_id,
                        skipped,
                        "event stream lagged, resweeping"
                    );
                    if let Err(err) = run_initial_sweep(observer.as_ref()).await {
                        warn!(
                            target: "relay::generator",
                            storage = %storage_id,
                            error = %err,
                            "resweep failed"
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
