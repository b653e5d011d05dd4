//! Watch-folder generator: pairs one source storage with one destination and
//! keeps them consistent, both reactively and through the periodic audit.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::generators::{
    COPY_STEP_PRIORITY, DELETE_STEP_PRIORITY, StorageObserver, ingest_steps,
};
use crate::storage::{StorageEventKind, StorageHandler};
use crate::store::TrackedItemStore;
use mediarelay_model::{
    ItemId, StorageId, TrackedMediaItem, WorkFlow, WorkFlowSource, WorkStep, WorkStepAction,
};

pub struct WatchFolderGenerator {
    source: Arc<dyn StorageHandler>,
    target: Arc<dyn StorageHandler>,
    tracked: Arc<dyn TrackedItemStore>,
    sink: mpsc::Sender<WorkFlow>,
    linger_ms: i64,
    cron_enabled: bool,
}

impl WatchFolderGenerator {
    pub fn new(
        source: Arc<dyn StorageHandler>,
        target: Arc<dyn StorageHandler>,
        tracked: Arc<dyn TrackedItemStore>,
        sink: mpsc::Sender<WorkFlow>,
        linger_ms: i64,
        cron_enabled: bool,
    ) -> Result<Self> {
        if !source.supports_read() {
            return Err(RelayError::Storage(format!(
                "watch flow requires read support on source storage {}",
                source.storage_id()
            )));
        }
        if !target.supports_write() {
            return Err(RelayError::Storage(format!(
                "watch flow requires write support on target storage {}",
                target.storage_id()
            )));
        }
        if source.storage_id() == target.storage_id() {
            return Err(RelayError::Storage(format!(
                "watch flow source and target are both {}",
                source.storage_id()
            )));
        }
        Ok(Self {
            source,
            target,
            tracked,
            sink,
            linger_ms,
            cron_enabled,
        })
    }

    async fn emit(&self, workflow: WorkFlow) -> Result<()> {
        self.sink
            .send(workflow)
            .await
            .map_err(|_| RelayError::Internal("workflow channel closed".into()))
    }

    /// A copy is required when the destination file is absent or its size
    /// differs from the source. Size equality means already synchronized;
    /// touch-only events never retransfer.
    async fn needs_copy(&self, name: &ItemId) -> Result<bool> {
        let src_file = self.source.get_file(name).await?;
        let src_props = self.source.get_file_properties(&src_file).await?;

        match self.target.get_file(name).await {
            Ok(dst_file) => {
                let dst_props = self.target.get_file_properties(&dst_file).await?;
                Ok(dst_props.size != src_props.size)
            }
            Err(err) if err.is_not_found() => Ok(true),
            Err(err) => Err(err),
        }
    }

    fn copy_workflow(&self, name: &ItemId) -> WorkFlow {
        let mut steps = vec![
            WorkStep::new(WorkStepAction::Copy, name.clone(), COPY_STEP_PRIORITY)
                .critical()
                .with_target(self.target.storage_id().clone()),
        ];
        steps.extend(ingest_steps(name));
        WorkFlow::new(WorkFlowSource::ExpectedMediaItem, steps, 1.0)
            .named(format!("Copy {name} to {}", self.target.storage_id()))
    }

    fn delete_workflow(
        &self,
        name: &ItemId,
        target_id: StorageId,
        source: WorkFlowSource,
    ) -> WorkFlow {
        let step = WorkStep::new(WorkStepAction::Delete, name.clone(), DELETE_STEP_PRIORITY)
            .critical()
            .with_target(target_id.clone());
        WorkFlow::new(source, vec![step], 1.0).named(format!("Remove {name} from {target_id}"))
    }

    /// Drop the tracked record, emitting one delete workflow per recorded
    /// destination.
    async fn drop_tracked(&self, name: &ItemId, source: WorkFlowSource) -> Result<()> {
        let Some(item) = self.tracked.get_by_id(name).await? else {
            return Ok(());
        };
        if &item.source_storage_id != self.source.storage_id() {
            return Ok(());
        }

        for target_id in item.target_storage_ids.clone() {
            self.emit(self.delete_workflow(name, target_id, source)).await?;
        }
        self.tracked.remove(name).await?;
        self.tracked.remove_attachments(name).await?;
        Ok(())
    }

    async fn track(&self, name: &ItemId) -> Result<()> {
        let storage_id = self.source.storage_id().clone();
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

    /// Cache the destination as holding a current copy.
    async fn record_target(&self, name: &ItemId) -> Result<()> {
        let target_id = self.target.storage_id().clone();
        self.tracked
            .upsert(
                name,
                Box::new(move |existing| {
                    existing.map(|mut item| {
                        item.add_target(target_id);
                        item
                    })
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
            .is_some_and(|item| &item.source_storage_id == self.source.storage_id()))
    }
}

#[async_trait]
impl StorageObserver for WatchFolderGenerator {
    fn storage(&self) -> Arc<dyn StorageHandler> {
        Arc::clone(&self.source)
    }

    fn tracked(&self) -> Arc<dyn TrackedItemStore> {
        Arc::clone(&self.tracked)
    }

    async fn on_file_present(&self, name: &ItemId, kind: StorageEventKind) -> Result<()> {
        if kind == StorageEventKind::Add && self.is_tracked_here(name).await? {
            self.track(name).await?;
            return Ok(());
        }

        self.track(name).await?;
        if self.needs_copy(name).await? {
            self.emit(self.copy_workflow(name)).await
        } else {
            // destination already matches; remember it holds a copy
            self.record_target(name).await
        }
    }

    async fn on_file_deleted(&self, name: &ItemId) -> Result<()> {
        self.drop_tracked(name, WorkFlowSource::SourceStorageRemove)
            .await
    }

    async fn on_item_expired(&self, name: &ItemId) -> Result<()> {
        self.drop_tracked(name, WorkFlowSource::TargetStorageRemove)
            .await
    }

    /// The audit pass that catches drift missed by the event stream: missed
    /// events, external deletions, restarts.
    async fn audit(&self) -> Result<usize> {
        if !self.cron_enabled {
            return Ok(0);
        }

        let source_id = self.source.storage_id().clone();
        let mut emitted = 0usize;
        for item in self.tracked.get_all_from_storage(&source_id).await? {
            match self.needs_copy(&item.id).await {
                Ok(true) => {
                    debug!(
                        target: "relay::generator",
                        file = %item.id,
                        destination = %self.target.storage_id(),
                        "audit found destination drift, emitting repair copy"
                    );
                    self.emit(self.copy_workflow(&item.id)).await?;
                    emitted += 1;
                }
                Ok(false) => {
                    self.track(&item.id).await?;
                    self.record_target(&item.id).await?;
                }
                Err(err) if err.is_not_found() => {
                    // source file vanished without a delete event
                    self.on_file_deleted(&item.id).await?;
                }
                Err(err) => {
                    warn!(
                        target: "relay::generator",
                        file = %item.id,
                        error = %err,
                        "audit probe failed"
                    );
                }
            }
        }
        Ok(emitted)
    }
}

impl fmt::Debug for WatchFolderGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchFolderGenerator")
            .field("source", self.source.storage_id())
            .field("target", self.target.storage_id())
            .field("cron_enabled", &self.cron_enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::MemoryStorageHandler;
    use crate::generators::run_initial_sweep;
    use crate::store::InMemoryTrackedItemStore;
    use mediarelay_model::WorkStepStatus;

    struct Fixture {
        generator: WatchFolderGenerator,
        source: Arc<MemoryStorageHandler>,
        target: Arc<MemoryStorageHandler>,
        tracked: Arc<InMemoryTrackedItemStore>,
        workflows: mpsc::Receiver<WorkFlow>,
    }

    fn fixture(cron: bool) -> Fixture {
        let source = MemoryStorageHandler::new("ingest");
        let target = MemoryStorageHandler::new("playout");
        let tracked = Arc::new(InMemoryTrackedItemStore::new());
        let (tx, rx) = mpsc::channel(64);
        let generator = WatchFolderGenerator::new(
            Arc::clone(&source) as Arc<dyn StorageHandler>,
            Arc::clone(&target) as Arc<dyn StorageHandler>,
            Arc::clone(&tracked) as Arc<dyn TrackedItemStore>,
            tx,
            60_000,
            cron,
        )
        .expect("generator");
        Fixture {
            generator,
            source,
            target,
            tracked,
            workflows: rx,
        }
    }

    #[tokio::test]
    async fn missing_destination_yields_critical_copy_first() {
        let mut fixture = fixture(false);
        fixture.source.seed("a.mxf", vec![0u8; 500_000]).await;

        run_initial_sweep(&fixture.generator).await.expect("sweep");

        let workflow = fixture.workflows.try_recv().expect("copy workflow");
        assert_eq!(workflow.source, WorkFlowSource::ExpectedMediaItem);
        assert_eq!(workflow.steps.len(), 5);
        assert_eq!(workflow.steps[0].action, WorkStepAction::Copy);
        assert!(workflow.steps[0].critical_step);
        assert_eq!(workflow.steps[0].priority, COPY_STEP_PRIORITY);
        assert_eq!(
            workflow.steps[0].target_storage_id,
            Some(StorageId::from("playout"))
        );
        assert_eq!(workflow.steps[0].status, WorkStepStatus::Idle);
    }

    #[tokio::test]
    async fn matching_destination_size_suppresses_the_copy() {
        let mut fixture = fixture(false);
        fixture.source.seed("a.mxf", vec![0u8; 500_000]).await;
        fixture.target.seed("a.mxf", vec![1u8; 500_000]).await;

        fixture
            .generator
            .on_file_present(&ItemId::from("a.mxf"), StorageEventKind::Change)
            .await
            .expect("event");

        assert!(fixture.workflows.try_recv().is_err(), "no copy expected");
        let item = fixture
            .tracked
            .get_by_id(&ItemId::from("a.mxf"))
            .await
            .expect("get")
            .expect("tracked");
        assert!(item.target_storage_ids.contains(&StorageId::from("playout")));
    }

    #[tokio::test]
    async fn size_mismatch_retriggers_the_copy() {
        let mut fixture = fixture(false);
        fixture.source.seed("a.mxf", vec![0u8; 500_000]).await;
        fixture.target.seed("a.mxf", vec![0u8; 400_000]).await;

        fixture
            .generator
            .on_file_present(&ItemId::from("a.mxf"), StorageEventKind::Change)
            .await
            .expect("event");

        let workflow = fixture.workflows.try_recv().expect("repair copy");
        assert_eq!(workflow.steps[0].action, WorkStepAction::Copy);
    }

    #[tokio::test]
    async fn source_delete_emits_target_deletes_and_drops_the_record() {
        let mut fixture = fixture(false);
        let mut item = TrackedMediaItem::new(
            ItemId::from("a.mxf"),
            StorageId::from("ingest"),
            60_000,
        );
        item.add_target(StorageId::from("playout"));
        fixture.tracked.put(item).await.expect("put");

        fixture
            .generator
            .on_file_deleted(&ItemId::from("a.mxf"))
            .await
            .expect("delete");

        let workflow = fixture.workflows.try_recv().expect("delete workflow");
        assert_eq!(workflow.source, WorkFlowSource::SourceStorageRemove);
        assert_eq!(workflow.steps.len(), 1);
        assert_eq!(workflow.steps[0].action, WorkStepAction::Delete);
        assert!(workflow.steps[0].critical_step);
        assert_eq!(
            workflow.steps[0].target_storage_id,
            Some(StorageId::from("playout"))
        );

        assert!(
            fixture
                .tracked
                .get_by_id(&ItemId::from("a.mxf"))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn audit_repairs_destination_drift() {
        let mut fixture = fixture(true);
        fixture.source.seed("a.mxf", vec![0u8; 100]).await;
        fixture.target.seed("a.mxf", vec![0u8; 100]).await;

        run_initial_sweep(&fixture.generator).await.expect("sweep");
        while fixture.workflows.try_recv().is_ok() {}

        // destination intact: audit emits nothing
        let emitted = fixture.generator.audit().await.expect("audit");
        assert_eq!(emitted, 0);
        assert!(fixture.workflows.try_recv().is_err());

        // destination lost externally: audit emits exactly one repair copy
        fixture.target.remove("a.mxf").await;
        let emitted = fixture.generator.audit().await.expect("audit");
        assert_eq!(emitted, 1);
        let workflow = fixture.workflows.try_recv().expect("repair workflow");
        assert_eq!(workflow.steps[0].action, WorkStepAction::Copy);
        assert!(workflow.steps[0].critical_step);
    }

    #[tokio::test]
    async fn audit_detects_missed_source_deletions() {
        let mut fixture = fixture(true);
        fixture.source.seed("a.mxf", vec![0u8; 100]).await;
        run_initial_sweep(&fixture.generator).await.expect("sweep");
        while fixture.workflows.try_recv().is_ok() {}
        fixture
            .tracked
            .upsert(
                &ItemId::from("a.mxf"),
                Box::new(|existing| {
                    existing.map(|mut item| {
                        item.add_target(StorageId::from("playout"));
                        item
                    })
                }),
            )
            .await
            .expect("record target");

        // the file disappears without any delete event reaching us
        fixture.source.remove("a.mxf").await;

        fixture.generator.audit().await.expect("audit");

        let workflow = fixture.workflows.try_recv().expect("cleanup workflow");
        assert_eq!(workflow.steps[0].action, WorkStepAction::Delete);
        assert!(
            fixture
                .tracked
                .get_by_id(&ItemId::from("a.mxf"))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn expiry_cleanup_is_tagged_target_storage_remove() {
        let mut fixture = fixture(false);
        let mut item = TrackedMediaItem::new(
            ItemId::from("old.mxf"),
            StorageId::from("ingest"),
            1_000,
        );
        item.add_target(StorageId::from("playout"));
        fixture.tracked.put(item).await.expect("put");

        fixture
            .generator
            .on_item_expired(&ItemId::from("old.mxf"))
            .await
            .expect("expire");

        let workflow = fixture.workflows.try_recv().expect("cleanup workflow");
        assert_eq!(workflow.source, WorkFlowSource::TargetStorageRemove);
        assert_eq!(workflow.steps[0].action, WorkStepAction::Delete);
        assert!(
            fixture
                .tracked
                .get_by_id(&ItemId::from("old.mxf"))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn cron_disabled_flows_skip_the_audit() {
        let fixture = fixture(false);
        fixture.source.seed("a.mxf", vec![0u8; 100]).await;
        let emitted = fixture.generator.audit().await.expect("audit");
        assert_eq!(emitted, 0);
    }

    #[tokio::test]
    async fn rejects_write_incapable_targets() {
        let source = MemoryStorageHandler::new("ingest");
        let target = MemoryStorageHandler::new("playout");
        target.set_read_only(true);
        let tracked = Arc::new(InMemoryTrackedItemStore::new());
        let (tx, _rx) = mpsc::channel(8);

        let err = WatchFolderGenerator::new(
            source as Arc<dyn StorageHandler>,
            target as Arc<dyn StorageHandler>,
            tracked as Arc<dyn TrackedItemStore>,
            tx,
            60_000,
            false,
        )
        .expect_err("must reject");
        assert!(matches!(err, RelayError::Storage(_)));
    }
}
