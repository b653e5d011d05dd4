//! Single-storage ingest generator: every observed file gets the
//! scan/metadata/thumbnail/preview chain, no copy step.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};
use crate::generators::{StorageObserver, ingest_steps};
use crate::storage::{StorageEventKind, StorageHandler};
use crate::store::TrackedItemStore;
use mediarelay_model::{ItemId, TrackedMediaItem, WorkFlow, WorkFlowSource};

pub struct LocalIngestGenerator {
    storage: Arc<dyn StorageHandler>,
    tracked: Arc<dyn TrackedItemStore>,
    sink: mpsc::Sender<WorkFlow>,
    linger_ms: i64,
}

impl LocalIngestGenerator {
    pub fn new(
        storage: Arc<dyn StorageHandler>,
        tracked: Arc<dyn TrackedItemStore>,
        sink: mpsc::Sender<WorkFlow>,
        linger_ms: i64,
    ) -> Result<Self> {
        if !storage.supports_read() {
            return Err(RelayError::Storage(format!(
                "ingest flow requires read support on storage {}",
                storage.storage_id()
            )));
        }
        Ok(Self {
            storage,
            tracked,
            sink,
            linger_ms,
        })
    }

    async fn emit(&self, workflow: WorkFlow) -> Result<()> {
        self.sink
            .send(workflow)
            .await
            .map_err(|_| RelayError::Internal("workflow channel closed".into()))
    }

    /// Create or refresh the tracked record for a file observed on this
    /// storage. A record pointing at another source storage is taken over.
    async fn track(&self, name: &ItemId) -> Result<()> {
        let storage_id = self.storage.storage_id().clone();
        let name_owned = name.clone();
        let linger_ms = self.linger_ms;
        self.tracked
            .upsert(
                name,
                Box::new(move |existing| {
                    let item = match existing {
                        Some(mut item) if item.source_storage_id == storage_id => {
                            item.refresh(Utc::now());
                            item
                        }
                        _ => TrackedMediaItem::new(name_owned, storage_id, linger_ms),
                    };
                    Some(item)
                }),
            )
            .await?;
        Ok(())
    }

    async fn is_tracked_here(&self, name: &ItemId) -> Result<bool> {
        Ok(self
            .tracked
            .get_by_id(name)
            .await?
            .is_some_and(|item| &item.source_storage_id == self.storage.storage_id()))
    }
}

#[async_trait]
impl StorageObserver for LocalIngestGenerator {
    fn storage(&self) -> Arc<dyn StorageHandler> {
        Arc::clone(&self.storage)
    }

    fn tracked(&self) -> Arc<dyn TrackedItemStore> {
        Arc::clone(&self.tracked)
    }

    async fn on_file_present(&self, name: &ItemId, kind: StorageEventKind) -> Result<()> {
        // A touch-only add for a file we already track just refreshes the
        // record; a change always reruns the post-processing chain.
        if kind == StorageEventKind::Add && self.is_tracked_here(name).await? {
            self.track(name).await?;
            return Ok(());
        }

        self.track(name).await?;
        let workflow = WorkFlow::new(WorkFlowSource::LocalMediaItem, ingest_steps(name), 0.0)
            .named(format!("Ingest {name}"));
        self.emit(workflow).await
    }

    async fn on_file_deleted(&self, name: &ItemId) -> Result<()> {
        if self.is_tracked_here(name).await? {
            self.tracked.remove(name).await?;
            self.tracked.remove_attachments(name).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for LocalIngestGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIngestGenerator")
            .field("storage", self.storage.storage_id())
            .finish()
    }
}
