//! Single-slot step executor.
//!
//! A worker is reserved with a synchronous `warm_up` (an atomic
//! compare-and-swap) before any work starts, closing the race between the
//! dispatcher's scheduling decision and execution start. `busy()` is the only
//! signal the dispatcher consults before assigning.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::events::StepEvent;
use crate::error::{RelayError, Result};
use crate::exec::{MediaTransformer, attachment_id};
use crate::storage::{PutOptions, StorageFile, StorageRegistry};
use crate::store::TrackedItemStore;
use mediarelay_model::{
    Attachment, AttachmentKind, WorkFlowId, WorkResult, WorkStep, WorkStepAction,
};

const STATE_IDLE: u8 = 0;
const STATE_WARMING: u8 = 1;
const STATE_WORKING: u8 = 2;

/// Progress deltas below this are coalesced away to avoid write
/// amplification on the persisted step.
const PROGRESS_GRANULARITY: f64 = 0.01;

/// Everything a worker needs to execute steps. Owned by the engine instance
/// and shared by reference; there are no process-wide registries.
pub struct WorkContext {
    pub storages: StorageRegistry,
    pub tracked: Arc<dyn TrackedItemStore>,
    pub transformer: Arc<dyn MediaTransformer>,
}

impl fmt::Debug for WorkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkContext")
            .field("storages", &self.storages)
            .field("tracked", &"dyn TrackedItemStore")
            .field("transformer", &"dyn MediaTransformer")
            .finish()
    }
}

/// Executes exactly one step at a time. State machine:
/// `idle -> warming -> working -> idle`.
pub struct Worker {
    id: usize,
    state: AtomicU8,
    /// In-flight cancel hook, registered only while a cancelable
    /// sub-operation (copy) is active.
    cancel: Mutex<Option<CancellationToken>>,
    finished: Notify,
}

impl Worker {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            state: AtomicU8::new(STATE_IDLE),
            cancel: Mutex::new(None),
            finished: Notify::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// True whenever warming or working.
    pub fn busy(&self) -> bool {
        self.state.load(Ordering::SeqCst) != STATE_IDLE
    }

    /// Synchronously reserve this worker. Returns false when it is already
    /// busy; the reservation is visible to `busy()` immediately.
    pub fn warm_up(&self) -> bool {
        self.state
            .compare_exchange(STATE_IDLE, STATE_WARMING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release a reservation that never turned into work.
    pub fn cancel_warm_up(&self) {
        let _ = self.state.compare_exchange(
            STATE_WARMING,
            STATE_IDLE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Fire the in-flight cancel hook, if any. Best-effort; the underlying
    /// I/O is not guaranteed to stop instantly.
    pub async fn try_to_abort(&self) {
        if let Some(token) = self.cancel.lock().await.as_ref() {
            token.cancel();
        }
    }

    /// Resolves once the current `do_work` settles. Used to drain workers
    /// during shutdown.
    pub async fn wait_until_finished(&self) {
        loop {
            let notified = self.finished.notified();
            if !self.busy() {
                return;
            }
            notified.await;
        }
    }

    /// Execute one step to completion and return its terminal result.
    /// Completion implies cooldown: the worker is idle again on return.
    pub async fn do_work(
        &self,
        workflow_id: WorkFlowId,
        step: WorkStep,
        ctx: &WorkContext,
        events: &mpsc::Sender<StepEvent>,
    ) -> WorkResult {
        self.state.store(STATE_WORKING, Ordering::SeqCst);
        debug!(
            target: "relay::worker",
            worker = self.id,
            workflow = %workflow_id,
            action = step.action.as_str(),
            file = %step.file_name,
            "step started"
        );

        let outcome = self.execute(workflow_id, &step, ctx, events).await;
        self.cancel.lock().await.take();

        let result = match outcome {
            Ok(messages) => WorkResult {
                status: mediarelay_model::WorkStepStatus::Done,
                messages,
            },
            Err(err) if err.is_cancelled() => WorkResult::canceled().with_message(err.to_string()),
            Err(err) => {
                warn!(
                    target: "relay::worker",
                    worker = self.id,
                    workflow = %workflow_id,
                    action = step.action.as_str(),
                    error = %err,
                    "step failed"
                );
                WorkResult::error(err.to_string())
            }
        };

        self.state.store(STATE_IDLE, Ordering::SeqCst);
        self.finished.notify_waiters();
        result
    }

    async fn execute(
        &self,
        workflow_id: WorkFlowId,
        step: &WorkStep,
        ctx: &WorkContext,
        events: &mpsc::Sender<StepEvent>,
    ) -> Result<Vec<String>> {
        match step.action {
            WorkStepAction::Copy => self.execute_copy(workflow_id, step, ctx, events).await,
            WorkStepAction::Delete => self.execute_delete(step, ctx).await,
            WorkStepAction::Scan => {
                self.execute_transform(AttachmentKind::Scan, step, ctx).await
            }
            WorkStepAction::GenerateMetadata => {
                self.execute_transform(AttachmentKind::Metadata, step, ctx)
                    .await
            }
            WorkStepAction::GenerateThumbnail => {
                self.execute_transform(AttachmentKind::Thumbnail, step, ctx)
                    .await
            }
            WorkStepAction::GeneratePreview => {
                self.execute_transform(AttachmentKind::Preview, step, ctx)
                    .await
            }
        }
    }

    async fn execute_copy(
        &self,
        workflow_id: WorkFlowId,
        step: &WorkStep,
        ctx: &WorkContext,
        events: &mpsc::Sender<StepEvent>,
    ) -> Result<Vec<String>> {
        let target_id = step.target_storage_id.clone().ok_or_else(|| {
            RelayError::Internal(format!("copy step for {} has no target storage", step.file_name))
        })?;
        let target = ctx.storages.get(&target_id)?;
        if !target.supports_write() {
            return Err(RelayError::Storage(format!(
                "storage {target_id} does not support writes"
            )));
        }

        let item = ctx
            .tracked
            .get_by_id(&step.file_name)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("{} is not tracked", step.file_name)))?;
        let source = ctx.storages.get(&item.source_storage_id)?;
        let src_file = source.get_file(&step.file_name).await?;
        let props = source.get_file_properties(&src_file).await?;

        let token = CancellationToken::new();
        *self.cancel.lock().await = Some(token.clone());

        let options = PutOptions {
            progress: Some(progress_reporter(workflow_id, step.id, events.clone())),
            cancel: token,
        };

        let copy_result = if target.supports_direct_copy()
            && src_file.local_path.is_some()
            && target.kind() == src_file.kind
        {
            target.copy_direct(&src_file, &options).await
        } else {
            let reader = source.open_read(&src_file).await?;
            target
                .put_file(&src_file.name, reader, props.size, &options)
                .await
        };
        self.cancel.lock().await.take();
        let landed = copy_result?;

        // The copy landed; record the destination before metadata chaining so
        // a chained failure does not roll back the tracking side effect.
        let recorded = target_id.clone();
        ctx.tracked
            .upsert(
                &step.file_name,
                Box::new(move |existing| {
                    existing.map(|mut item| {
                        item.add_target(recorded);
                        item
                    })
                }),
            )
            .await?;

        let mut messages = vec![format!("copied {} to {target_id}", step.file_name)];

        // A successful copy is not done until basic metadata has been
        // re-extracted against the landed file.
        let meta_file = if landed.local_path.is_some() {
            &landed
        } else {
            &src_file
        };
        messages.extend(
            self.run_transform(AttachmentKind::Metadata, meta_file, ctx)
                .await?,
        );

        Ok(messages)
    }

    async fn execute_delete(&self, step: &WorkStep, ctx: &WorkContext) -> Result<Vec<String>> {
        let target_id = step.target_storage_id.clone().ok_or_else(|| {
            RelayError::Internal(format!(
                "delete step for {} has no target storage",
                step.file_name
            ))
        })?;
        let target = ctx.storages.get(&target_id)?;

        match target.get_file(&step.file_name).await {
            Ok(file) => target.delete_file(&file).await?,
            // Already gone; the absence is the desired end state.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let removed = target_id.clone();
        ctx.tracked
            .upsert(
                &step.file_name,
                Box::new(move |existing| {
                    existing.map(|mut item| {
                        item.remove_target(&removed);
                        item
                    })
                }),
            )
            .await?;

        Ok(vec![format!("deleted {} from {target_id}", step.file_name)])
    }

    async fn execute_transform(
        &self,
        kind: AttachmentKind,
        step: &WorkStep,
        ctx: &WorkContext,
    ) -> Result<Vec<String>> {
        let item = ctx
            .tracked
            .get_by_id(&step.file_name)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("{} is not tracked", step.file_name)))?;
        let source = ctx.storages.get(&item.source_storage_id)?;
        let file = source.get_file(&step.file_name).await?;
        self.run_transform(kind, &file, ctx).await
    }

    async fn run_transform(
        &self,
        kind: AttachmentKind,
        file: &StorageFile,
        ctx: &WorkContext,
    ) -> Result<Vec<String>> {
        let path = file.local_path.as_ref().ok_or_else(|| {
            RelayError::Storage(format!("{} has no resolvable local path", file.name))
        })?;

        let (content_type, payload) = match kind {
            AttachmentKind::Scan => (
                "application/json",
                serde_json::to_vec(&ctx.transformer.scan(path).await?)?,
            ),
            AttachmentKind::Metadata => (
                "application/json",
                serde_json::to_vec(&ctx.transformer.metadata(path).await?)?,
            ),
            AttachmentKind::Thumbnail => ("image/jpeg", ctx.transformer.thumbnail(path).await?),
            AttachmentKind::Preview => ("video/webm", ctx.transformer.preview(path).await?),
        };

        let attachment = Attachment::new(
            attachment_id(kind, &file.name),
            kind,
            content_type,
            payload,
        );
        ctx.tracked.put_attachment(&file.name, attachment).await?;

        Ok(vec![format!(
            "stored {} attachment for {}",
            kind.as_str(),
            file.name
        )])
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::SeqCst) {
            STATE_WARMING => "warming",
            STATE_WORKING => "working",
            _ => "idle",
        };
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &state)
            .finish()
    }
}

/// Progress callback for copy operations. Updates are monotonic and
/// coalesced before they reach the dispatch loop; completion (1.0) always
/// goes through.
fn progress_reporter(
    workflow_id: WorkFlowId,
    step_id: mediarelay_model::WorkStepId,
    tx: mpsc::Sender<StepEvent>,
) -> crate::storage::ProgressFn {
    let last = std::sync::Mutex::new(0.0_f64);
    Arc::new(move |value: f64| {
        let Ok(mut last) = last.lock() else {
            return;
        };
        if value > *last && (value - *last >= PROGRESS_GRANULARITY || value >= 1.0) {
            *last = value;
            let _ = tx.try_send(StepEvent::Progress {
                workflow_id,
                step_id,
                progress: value,
            });
        }
    })
}
