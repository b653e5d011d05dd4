//! Step scheduling across all open workflows.
//!
//! One dispatcher instance turns the set of idle steps into assignments onto
//! a bounded worker pool, respecting step priority, workflow priority, age,
//! and critical-path fail-fast. All document mutation funnels through here
//! (workers report back over the step-event queue), so updates to one
//! workflow never interleave.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::engine::events::{RelayEvent, RelayEventBus, StepEvent};
use crate::engine::status::{StatusReport, StatusSeverity, StorageStatus, StuckStepWarning};
use crate::engine::worker::{WorkContext, Worker};
use crate::error::{RelayError, Result};
use crate::store::WorkflowStore;
use mediarelay_model::{
    WorkFlow, WorkFlowId, WorkResult, WorkStepId, WorkStepStatus,
};

struct Assignment {
    worker: usize,
    started: Instant,
}

#[derive(Default)]
struct DispatchState {
    assignments: HashMap<WorkStepId, Assignment>,
}

/// The scheduler. Also the only component that mutates persisted workflow
/// documents once they are submitted.
pub struct Dispatcher {
    workflows: Arc<dyn WorkflowStore>,
    ctx: Arc<WorkContext>,
    pool: Vec<Arc<Worker>>,
    step_events_tx: mpsc::Sender<StepEvent>,
    step_events_rx: Mutex<Option<mpsc::Receiver<StepEvent>>>,
    bus: RelayEventBus,
    stuck_threshold_ms: u64,
    state: Mutex<DispatchState>,
}

impl Dispatcher {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        ctx: Arc<WorkContext>,
        bus: RelayEventBus,
        config: &RelayConfig,
    ) -> Self {
        let pool_size = config.workers.pool_size.max(1);
        let pool = (0..pool_size).map(|id| Arc::new(Worker::new(id))).collect();
        let (step_events_tx, step_events_rx) = mpsc::channel(1024);

        Self {
            workflows,
            ctx,
            pool,
            step_events_tx,
            step_events_rx: Mutex::new(Some(step_events_rx)),
            bus,
            stuck_threshold_ms: config.workers.stuck_threshold_ms,
            state: Mutex::new(DispatchState::default()),
        }
    }

    /// Receiver half of the step-event queue. The runtime takes it once and
    /// pumps it into [`Dispatcher::handle_step_event`].
    pub async fn take_step_events(&self) -> Option<mpsc::Receiver<StepEvent>> {
        self.step_events_rx.lock().await.take()
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.pool
    }

    /// Persist a new workflow (steps idle) and trigger scheduling. Fails only
    /// on persistence error; the submitting generator retries or drops.
    pub async fn submit(&self, workflow: WorkFlow) -> Result<()> {
        debug!(
            target: "relay::dispatch",
            workflow = %workflow.id,
            steps = workflow.steps.len(),
            source = ?workflow.source,
            "workflow submitted"
        );
        self.workflows.insert(&workflow).await?;
        self.bus.publish(RelayEvent::WorkflowSubmitted {
            workflow_id: workflow.id,
        });

        let mut state = self.state.lock().await;
        self.tick_locked(&mut state).await
    }

    /// Run one scheduling pass: fail-fast cascade, then assign runnable steps
    /// to free workers in priority order.
    pub async fn schedule_tick(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.tick_locked(&mut state).await
    }

    /// Route one event from the worker queue.
    pub async fn handle_step_event(&self, event: StepEvent) -> Result<()> {
        match event {
            StepEvent::Progress {
                workflow_id,
                step_id,
                progress,
            } => self.apply_progress(workflow_id, step_id, progress).await,
            StepEvent::Finished {
                workflow_id,
                step_id,
                result,
            } => self.on_step_complete(workflow_id, step_id, result).await,
        }
    }

    /// Record a terminal step result, cascade critical failures, re-derive
    /// the workflow outcome, and schedule follow-up work.
    pub async fn on_step_complete(
        &self,
        workflow_id: WorkFlowId,
        step_id: WorkStepId,
        result: WorkResult,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.assignments.remove(&step_id);

        let Some(mut workflow) = self.workflows.get(workflow_id).await? else {
            warn!(
                target: "relay::dispatch",
                workflow = %workflow_id,
                "completion for unknown workflow"
            );
            return self.tick_locked(&mut state).await;
        };

        let status = result.status;
        if let Some(step) = workflow.step_mut(step_id) {
            // statuses only move forward; a completion racing an abort is stale
            if !step.status.is_terminal() {
                step.status = result.status;
                step.messages.extend(result.messages);
                if status == WorkStepStatus::Done {
                    step.progress = 1.0;
                    step.expected_left = None;
                }
            }
        }

        apply_critical_cascade(&mut workflow);
        workflow.recompute_outcome();
        self.workflows.update(&workflow).await?;

        self.bus.publish(RelayEvent::StepCompleted {
            workflow_id,
            step_id,
            status,
        });
        if workflow.finished {
            info!(
                target: "relay::dispatch",
                workflow = %workflow.id,
                success = workflow.success,
                "workflow finished"
            );
            self.bus.publish(RelayEvent::WorkflowFinished {
                workflow_id,
                success: workflow.success,
            });
        }

        self.tick_locked(&mut state).await
    }

    /// Monotonic progress write-through for a working step.
    pub async fn apply_progress(
        &self,
        workflow_id: WorkFlowId,
        step_id: WorkStepId,
        progress: f64,
    ) -> Result<()> {
        // hold the dispatch lock so this write cannot interleave with a
        // concurrent tick or completion touching the same document
        let state = self.state.lock().await;
        let started = state.assignments.get(&step_id).map(|a| a.started);

        let Some(mut workflow) = self.workflows.get(workflow_id).await? else {
            return Ok(());
        };
        let Some(step) = workflow.step_mut(step_id) else {
            return Ok(());
        };
        if step.status != WorkStepStatus::Working || progress <= step.progress {
            return Ok(());
        }

        step.progress = progress.clamp(0.0, 1.0);
        if let Some(started) = started {
            if progress > 0.05 && progress < 1.0 {
                let elapsed = started.elapsed().as_secs_f64();
                step.expected_left = Some(elapsed * (1.0 - progress) / progress);
            }
        }
        let result = self.workflows.update(&workflow).await;
        drop(state);
        result
    }

    /// Abort a workflow: fire the cancel hook on the worker owning its
    /// current step (if any), then cancel all remaining schedulable steps.
    pub async fn abort_workflow(&self, workflow_id: WorkFlowId) -> Result<()> {
        let mut state = self.state.lock().await;
        self.abort_locked(&mut state, workflow_id).await
    }

    async fn abort_locked(
        &self,
        state: &mut DispatchState,
        workflow_id: WorkFlowId,
    ) -> Result<()> {
        let Some(mut workflow) = self.workflows.get(workflow_id).await? else {
            return Err(RelayError::NotFound(format!("workflow {workflow_id}")));
        };
        if workflow.finished {
            return Ok(());
        }

        info!(target: "relay::dispatch", workflow = %workflow_id, "aborting workflow");

        for step in workflow.steps.iter_mut() {
            match step.status {
                WorkStepStatus::Idle | WorkStepStatus::Blocked => {
                    step.status = WorkStepStatus::Canceled;
                }
                WorkStepStatus::Working => {
                    if let Some(assignment) = state.assignments.get(&step.id) {
                        // best-effort; the worker reports canceled on its own
                        self.pool[assignment.worker].try_to_abort().await;
                    }
                }
                _ => {}
            }
        }

        workflow.recompute_outcome();
        self.workflows.update(&workflow).await?;
        if workflow.finished {
            self.bus.publish(RelayEvent::WorkflowFinished {
                workflow_id,
                success: workflow.success,
            });
        }
        Ok(())
    }

    /// Reset a finished-with-failure workflow to idle and resubmit it.
    pub async fn restart_workflow(&self, workflow_id: WorkFlowId) -> Result<()> {
        let mut state = self.state.lock().await;
        self.restart_locked(&mut state, workflow_id).await
    }

    async fn restart_locked(
        &self,
        state: &mut DispatchState,
        workflow_id: WorkFlowId,
    ) -> Result<()> {
        let Some(mut workflow) = self.workflows.get(workflow_id).await? else {
            return Err(RelayError::NotFound(format!("workflow {workflow_id}")));
        };
        if !workflow.finished || workflow.success {
            return Err(RelayError::Internal(format!(
                "workflow {workflow_id} is not finished with failure"
            )));
        }

        info!(target: "relay::dispatch", workflow = %workflow_id, "restarting workflow");

        for step in workflow.steps.iter_mut() {
            step.status = WorkStepStatus::Idle;
            step.progress = 0.0;
            step.messages.clear();
            step.expected_left = None;
        }
        workflow.finished = false;
        workflow.success = false;
        workflow.modified = Some(Utc::now());

        self.workflows.update(&workflow).await?;
        self.bus.publish(RelayEvent::WorkflowSubmitted { workflow_id });
        self.tick_locked(state).await
    }

    pub async fn abort_all_workflows(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for workflow in self.workflows.load_open().await? {
            if let Err(err) = self.abort_locked(&mut state, workflow.id).await {
                warn!(
                    target: "relay::dispatch",
                    workflow = %workflow.id,
                    error = %err,
                    "abort failed"
                );
            }
        }
        Ok(())
    }

    pub async fn restart_all_workflows(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for workflow in self.workflows.load_all().await? {
            if workflow.finished && !workflow.success {
                if let Err(err) = self.restart_locked(&mut state, workflow.id).await {
                    warn!(
                        target: "relay::dispatch",
                        workflow = %workflow.id,
                        error = %err,
                        "restart failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Reload persisted workflows after a process restart. Steps left
    /// `working` at crash time have no owning worker, so they are treated as
    /// idle and rescheduled.
    pub async fn recover(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for mut workflow in self.workflows.load_open().await? {
            let mut dirty = false;
            for step in workflow.steps.iter_mut() {
                if step.status == WorkStepStatus::Working {
                    step.status = WorkStepStatus::Idle;
                    step.progress = 0.0;
                    dirty = true;
                }
            }
            if dirty {
                info!(
                    target: "relay::dispatch",
                    workflow = %workflow.id,
                    "recovered in-flight steps to idle"
                );
                self.workflows.update(&workflow).await?;
            }
        }
        self.tick_locked(&mut state).await
    }

    /// Aggregate health for the control plane.
    pub async fn status(&self) -> Result<StatusReport> {
        let open = self.workflows.load_open().await?;

        let (queue_depth, stuck_steps) = {
            let state = self.state.lock().await;
            let queue_depth = open
                .iter()
                .flat_map(|wf| wf.steps.iter())
                .filter(|s| {
                    s.status == WorkStepStatus::Idle && !state.assignments.contains_key(&s.id)
                })
                .count();

            let mut stuck = Vec::new();
            for workflow in &open {
                for step in &workflow.steps {
                    if let Some(assignment) = state.assignments.get(&step.id) {
                        let running_for_ms = assignment.started.elapsed().as_millis() as u64;
                        if running_for_ms > self.stuck_threshold_ms {
                            stuck.push(StuckStepWarning {
                                workflow_id: workflow.id,
                                step_id: step.id,
                                action: step.action,
                                running_for_ms,
                            });
                        }
                    }
                }
            }
            (queue_depth, stuck)
        };

        let mut storages = Vec::new();
        let mut unreachable = false;
        for (storage_id, handler) in self.ctx.storages.iter() {
            match handler.usage().await {
                Ok(usage) => storages.push(StorageStatus {
                    storage_id: storage_id.clone(),
                    usage,
                    reachable: true,
                }),
                Err(err) => {
                    warn!(
                        target: "relay::dispatch",
                        storage = %storage_id,
                        error = %err,
                        "storage usage probe failed"
                    );
                    unreachable = true;
                    storages.push(StorageStatus {
                        storage_id: storage_id.clone(),
                        usage: None,
                        reachable: false,
                    });
                }
            }
        }

        let severity = if unreachable {
            StatusSeverity::Bad
        } else if stuck_steps.is_empty() {
            StatusSeverity::Good
        } else {
            StatusSeverity::Warning
        };

        Ok(StatusReport {
            severity,
            sampled_at: Utc::now(),
            workers_total: self.pool.len(),
            workers_busy: self.pool.iter().filter(|w| w.busy()).count(),
            queue_depth,
            open_workflows: open.len(),
            dropped_submissions: 0,
            stuck_steps,
            storages,
        })
    }

    async fn tick_locked(&self, state: &mut DispatchState) -> Result<()> {
        let mut open = self.workflows.load_open().await?;

        // fail fast: a critical error skips everything scheduled after it
        for workflow in open.iter_mut() {
            if apply_critical_cascade(workflow) {
                workflow.recompute_outcome();
                self.workflows.update(workflow).await?;
                if workflow.finished {
                    self.bus.publish(RelayEvent::WorkflowFinished {
                        workflow_id: workflow.id,
                        success: workflow.success,
                    });
                }
            }
        }

        struct Candidate {
            step_priority: f64,
            workflow_priority: f64,
            created: DateTime<Utc>,
            workflow_index: usize,
            step_id: WorkStepId,
        }

        let mut candidates = Vec::new();
        for (workflow_index, workflow) in open.iter().enumerate() {
            if workflow.finished {
                continue;
            }
            for step in &workflow.steps {
                if step.status == WorkStepStatus::Idle
                    && !state.assignments.contains_key(&step.id)
                {
                    candidates.push(Candidate {
                        step_priority: step.priority,
                        workflow_priority: workflow.priority,
                        created: workflow.created,
                        workflow_index,
                        step_id: step.id,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            b.step_priority
                .total_cmp(&a.step_priority)
                .then(b.workflow_priority.total_cmp(&a.workflow_priority))
                .then(a.created.cmp(&b.created))
        });

        for candidate in candidates {
            let Some(worker) = self.pool.iter().find(|w| !w.busy()) else {
                break;
            };
            if !worker.warm_up() {
                continue;
            }

            let workflow = &mut open[candidate.workflow_index];
            let workflow_id = workflow.id;
            let Some(step) = workflow.step_mut(candidate.step_id) else {
                worker.cancel_warm_up();
                continue;
            };
            step.status = WorkStepStatus::Working;
            let step = step.clone();

            // persist the transition before execution starts so a crash
            // mid-step recovers deterministically
            if let Err(err) = self.workflows.update(workflow).await {
                worker.cancel_warm_up();
                return Err(err);
            }

            debug!(
                target: "relay::dispatch",
                workflow = %workflow_id,
                step = %step.id,
                action = step.action.as_str(),
                worker = worker.id(),
                "step assigned"
            );

            state.assignments.insert(
                step.id,
                Assignment {
                    worker: worker.id(),
                    started: Instant::now(),
                },
            );

            let worker = Arc::clone(worker);
            let ctx = Arc::clone(&self.ctx);
            let tx = self.step_events_tx.clone();
            tokio::spawn(async move {
                let step_id = step.id;
                let result = worker.do_work(workflow_id, step, &ctx, &tx).await;
                let _ = tx
                    .send(StepEvent::Finished {
                        workflow_id,
                        step_id,
                        result,
                    })
                    .await;
            });
        }

        Ok(())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pool_size", &self.pool.len())
            .field(
                "workers_busy",
                &self.pool.iter().filter(|w| w.busy()).count(),
            )
            .finish()
    }
}

/// Skip every schedulable step after an errored critical step. Returns true
/// when any step changed.
fn apply_critical_cascade(workflow: &mut WorkFlow) -> bool {
    let Some(error_index) = workflow.first_critical_error() else {
        return false;
    };
    let mut dirty = false;
    for step in workflow.steps.iter_mut().skip(error_index + 1) {
        if matches!(
            step.status,
            WorkStepStatus::Idle | WorkStepStatus::Blocked
        ) {
            step.status = WorkStepStatus::Skipped;
            dirty = true;
        }
    }
    dirty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{MemoryStorageHandler, StubTransformer, tracked_item};
    use crate::storage::StorageRegistry;
    use crate::store::{
        InMemoryTrackedItemStore, InMemoryWorkflowStore, TrackedItemStore, WorkflowStore,
    };
    use mediarelay_model::{
        ItemId, WorkFlowSource, WorkStep, WorkStepAction,
    };
    use std::time::Duration;

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        workflows: Arc<InMemoryWorkflowStore>,
        tracked: Arc<InMemoryTrackedItemStore>,
        source: Arc<MemoryStorageHandler>,
        target: Arc<MemoryStorageHandler>,
        step_events: mpsc::Receiver<StepEvent>,
    }

    async fn fixture(pool_size: usize) -> Fixture {
        let workflows = Arc::new(InMemoryWorkflowStore::new());
        let tracked = Arc::new(InMemoryTrackedItemStore::new());
        let source = MemoryStorageHandler::new("ingest");
        let target = MemoryStorageHandler::new("playout");

        let mut storages = StorageRegistry::new();
        storages.insert(Arc::clone(&source) as Arc<dyn crate::storage::StorageHandler>);
        storages.insert(Arc::clone(&target) as Arc<dyn crate::storage::StorageHandler>);

        let ctx = Arc::new(WorkContext {
            storages,
            tracked: Arc::clone(&tracked) as Arc<dyn TrackedItemStore>,
            transformer: Arc::new(StubTransformer::default()),
        });

        let mut config = RelayConfig::default();
        config.workers.pool_size = pool_size;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&workflows) as Arc<dyn WorkflowStore>,
            ctx,
            RelayEventBus::default(),
            &config,
        ));
        let step_events = dispatcher
            .take_step_events()
            .await
            .expect("step event receiver");

        Fixture {
            dispatcher,
            workflows,
            tracked,
            source,
            target,
            step_events,
        }
    }

    /// Pump worker events into the dispatcher until the workflow settles.
    async fn drive_to_finish(fixture: &mut Fixture, workflow_id: WorkFlowId) -> WorkFlow {
        for _ in 0..64 {
            let workflow = fixture
                .workflows
                .get(workflow_id)
                .await
                .expect("get")
                .expect("workflow exists");
            if workflow.finished {
                return workflow;
            }

            let event = tokio::time::timeout(Duration::from_secs(5), fixture.step_events.recv())
                .await
                .expect("worker event expected")
                .expect("channel open");
            fixture
                .dispatcher
                .handle_step_event(event)
                .await
                .expect("handle event");
        }
        panic!("workflow did not settle");
    }

    fn scan_step(name: &str, priority: f64) -> WorkStep {
        WorkStep::new(WorkStepAction::Scan, ItemId::from(name), priority)
    }

    #[tokio::test]
    async fn higher_priority_step_is_assigned_first() {
        let mut fixture = fixture(1).await;
        fixture.source.seed("a.mxf", vec![1u8; 10]).await;
        fixture
            .tracked
            .put(tracked_item("a.mxf", "ingest"))
            .await
            .expect("track");

        let low = scan_step("a.mxf", 0.5);
        let high = scan_step("a.mxf", 0.9);
        let high_id = high.id;
        let workflow = WorkFlow::new(WorkFlowSource::LocalMediaItem, vec![low, high], 0.0);
        let workflow_id = workflow.id;

        fixture.dispatcher.submit(workflow).await.expect("submit");

        // one worker: the 0.9 step must have been picked for the only slot
        let persisted = fixture
            .workflows
            .get(workflow_id)
            .await
            .expect("get")
            .expect("workflow");
        let working: Vec<_> = persisted
            .steps
            .iter()
            .filter(|s| s.status == WorkStepStatus::Working)
            .collect();
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].id, high_id);

        let finished = drive_to_finish(&mut fixture, workflow_id).await;
        assert!(finished.success);
    }

    #[tokio::test]
    async fn never_assigns_two_steps_to_one_worker() {
        let mut fixture = fixture(1).await;
        fixture.source.seed("a.mxf", vec![1u8; 10]).await;
        fixture
            .tracked
            .put(tracked_item("a.mxf", "ingest"))
            .await
            .expect("track");

        let workflow = WorkFlow::new(
            WorkFlowSource::LocalMediaItem,
            vec![scan_step("a.mxf", 0.9), scan_step("a.mxf", 0.8)],
            0.0,
        );
        let workflow_id = workflow.id;
        fixture.dispatcher.submit(workflow).await.expect("submit");

        let persisted = fixture
            .workflows
            .get(workflow_id)
            .await
            .expect("get")
            .expect("workflow");
        let working = persisted
            .steps
            .iter()
            .filter(|s| s.status == WorkStepStatus::Working)
            .count();
        let idle = persisted
            .steps
            .iter()
            .filter(|s| s.status == WorkStepStatus::Idle)
            .count();
        assert_eq!(working, 1, "single worker takes a single step");
        assert_eq!(idle, 1);

        let finished = drive_to_finish(&mut fixture, workflow_id).await;
        assert!(finished.success);
    }

    #[tokio::test]
    async fn four_successful_steps_finish_the_workflow() {
        let mut fixture = fixture(2).await;
        fixture.source.seed("a.mxf", vec![1u8; 10]).await;
        fixture
            .tracked
            .put(tracked_item("a.mxf", "ingest"))
            .await
            .expect("track");

        let steps = vec![
            scan_step("a.mxf", 1.0),
            WorkStep::new(WorkStepAction::GenerateMetadata, ItemId::from("a.mxf"), 0.75),
            WorkStep::new(WorkStepAction::GenerateThumbnail, ItemId::from("a.mxf"), 0.5),
            WorkStep::new(WorkStepAction::GeneratePreview, ItemId::from("a.mxf"), 0.3),
        ];
        let workflow = WorkFlow::new(WorkFlowSource::LocalMediaItem, steps, 0.0);
        let workflow_id = workflow.id;
        fixture.dispatcher.submit(workflow).await.expect("submit");

        let finished = drive_to_finish(&mut fixture, workflow_id).await;
        assert!(finished.finished);
        assert!(finished.success);
        assert!(
            finished
                .steps
                .iter()
                .all(|s| s.status == WorkStepStatus::Done)
        );
    }

    #[tokio::test]
    async fn critical_copy_failure_skips_downstream_steps() {
        let mut fixture = fixture(1).await;
        fixture.source.seed("a.mxf", vec![1u8; 10]).await;
        fixture.target.fail_puts(true);
        fixture
            .tracked
            .put(tracked_item("a.mxf", "ingest"))
            .await
            .expect("track");

        let copy = WorkStep::new(WorkStepAction::Copy, ItemId::from("a.mxf"), 2.0)
            .critical()
            .with_target("playout".into());
        let steps = vec![
            copy,
            scan_step("a.mxf", 1.0),
            WorkStep::new(WorkStepAction::GenerateThumbnail, ItemId::from("a.mxf"), 0.5),
        ];
        let workflow = WorkFlow::new(WorkFlowSource::ExpectedMediaItem, steps, 0.0);
        let workflow_id = workflow.id;
        fixture.dispatcher.submit(workflow).await.expect("submit");

        let finished = drive_to_finish(&mut fixture, workflow_id).await;
        assert!(finished.finished);
        assert!(!finished.success);
        assert_eq!(finished.steps[0].status, WorkStepStatus::Error);
        assert_eq!(finished.steps[1].status, WorkStepStatus::Skipped);
        assert_eq!(finished.steps[2].status, WorkStepStatus::Skipped);
        assert!(!finished.steps[0].messages.is_empty());
    }

    #[tokio::test]
    async fn delete_with_absent_tracked_record_succeeds() {
        let mut fixture = fixture(1).await;

        let delete = WorkStep::new(WorkStepAction::Delete, ItemId::from("gone.mxf"), 2.0)
            .critical()
            .with_target("playout".into());
        let workflow = WorkFlow::new(WorkFlowSource::SourceStorageRemove, vec![delete], 0.0);
        let workflow_id = workflow.id;
        fixture.dispatcher.submit(workflow).await.expect("submit");

        let finished = drive_to_finish(&mut fixture, workflow_id).await;
        assert!(finished.success);
        assert_eq!(finished.steps[0].status, WorkStepStatus::Done);
    }

    #[tokio::test]
    async fn abort_cancels_pending_and_inflight_steps() {
        let mut fixture = fixture(1).await;
        fixture.source.seed("big.mxf", vec![1u8; 100]).await;
        fixture.target.set_put_delay_ms(10_000);
        fixture
            .tracked
            .put(tracked_item("big.mxf", "ingest"))
            .await
            .expect("track");

        let copy = WorkStep::new(WorkStepAction::Copy, ItemId::from("big.mxf"), 2.0)
            .with_target("playout".into());
        let steps = vec![copy, scan_step("big.mxf", 1.0)];
        let workflow = WorkFlow::new(WorkFlowSource::ExpectedMediaItem, steps, 0.0);
        let workflow_id = workflow.id;
        fixture.dispatcher.submit(workflow).await.expect("submit");

        // give the copy a moment to register its cancel hook
        tokio::time::sleep(Duration::from_millis(500)).await;
        fixture
            .dispatcher
            .abort_workflow(workflow_id)
            .await
            .expect("abort");

        let finished = drive_to_finish(&mut fixture, workflow_id).await;
        assert!(finished.finished);
        assert!(
            finished
                .steps
                .iter()
                .all(|s| s.status == WorkStepStatus::Canceled)
        );
    }

    #[tokio::test]
    async fn restart_resets_a_failed_workflow_and_reruns_it() {
        let mut fixture = fixture(1).await;
        fixture.source.seed("a.mxf", vec![1u8; 10]).await;
        fixture.target.fail_puts(true);
        fixture
            .tracked
            .put(tracked_item("a.mxf", "ingest"))
            .await
            .expect("track");

        let copy = WorkStep::new(WorkStepAction::Copy, ItemId::from("a.mxf"), 2.0)
            .critical()
            .with_target("playout".into());
        let workflow = WorkFlow::new(WorkFlowSource::ExpectedMediaItem, vec![copy], 0.0);
        let workflow_id = workflow.id;
        fixture.dispatcher.submit(workflow).await.expect("submit");

        let failed = drive_to_finish(&mut fixture, workflow_id).await;
        assert!(!failed.success);

        // the transient storage fault clears; restart should rerun to success
        fixture.target.fail_puts(false);
        fixture
            .dispatcher
            .restart_workflow(workflow_id)
            .await
            .expect("restart");

        let finished = drive_to_finish(&mut fixture, workflow_id).await;
        assert!(finished.success);
        assert!(fixture.target.contents("a.mxf").await.is_some());
    }

    #[tokio::test]
    async fn restart_rejects_successful_workflows() {
        let mut fixture = fixture(1).await;
        fixture.source.seed("a.mxf", vec![1u8; 10]).await;
        fixture
            .tracked
            .put(tracked_item("a.mxf", "ingest"))
            .await
            .expect("track");

        let workflow = WorkFlow::new(
            WorkFlowSource::LocalMediaItem,
            vec![scan_step("a.mxf", 1.0)],
            0.0,
        );
        let workflow_id = workflow.id;
        fixture.dispatcher.submit(workflow).await.expect("submit");
        drive_to_finish(&mut fixture, workflow_id).await;

        let err = fixture
            .dispatcher
            .restart_workflow(workflow_id)
            .await
            .expect_err("restart of a successful workflow is refused");
        assert!(matches!(err, RelayError::Internal(_)));
    }

    #[tokio::test]
    async fn recover_reschedules_steps_left_working() {
        let mut fixture = fixture(1).await;
        fixture.source.seed("a.mxf", vec![1u8; 10]).await;
        fixture
            .tracked
            .put(tracked_item("a.mxf", "ingest"))
            .await
            .expect("track");

        // simulate a crash: a persisted workflow with a step still "working"
        let mut workflow = WorkFlow::new(
            WorkFlowSource::LocalMediaItem,
            vec![scan_step("a.mxf", 1.0)],
            0.0,
        );
        workflow.steps[0].status = WorkStepStatus::Working;
        workflow.steps[0].progress = 0.4;
        let workflow_id = workflow.id;
        fixture.workflows.insert(&workflow).await.expect("insert");

        fixture.dispatcher.recover().await.expect("recover");

        let finished = drive_to_finish(&mut fixture, workflow_id).await;
        assert!(finished.success);
        assert_eq!(finished.steps[0].status, WorkStepStatus::Done);
    }

    #[tokio::test]
    async fn status_reports_pool_and_queue_saturation() {
        let mut fixture = fixture(1).await;
        fixture.source.seed("big.mxf", vec![1u8; 100]).await;
        fixture.target.set_put_delay_ms(5_000);
        fixture
            .tracked
            .put(tracked_item("big.mxf", "ingest"))
            .await
            .expect("track");

        let copy = WorkStep::new(WorkStepAction::Copy, ItemId::from("big.mxf"), 2.0)
            .with_target("playout".into());
        let steps = vec![copy, scan_step("big.mxf", 1.0)];
        let workflow = WorkFlow::new(WorkFlowSource::ExpectedMediaItem, steps, 0.0);
        let workflow_id = workflow.id;
        fixture.dispatcher.submit(workflow).await.expect("submit");

        let status = fixture.dispatcher.status().await.expect("status");
        assert_eq!(status.workers_total, 1);
        assert_eq!(status.workers_busy, 1);
        assert_eq!(status.queue_depth, 1);
        assert_eq!(status.open_workflows, 1);
        assert_eq!(status.severity, StatusSeverity::Good);
        assert_eq!(status.storages.len(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        fixture
            .dispatcher
            .abort_workflow(workflow_id)
            .await
            .expect("abort");
        drive_to_finish(&mut fixture, workflow_id).await;
    }
}
