//! Supervises the dispatcher, generators, cron audit, and housekeeping loops
//! inside a single process.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::engine::dispatcher::Dispatcher;
use crate::engine::events::{RelayEvent, RelayEventBus};
use crate::engine::status::StatusReport;
use crate::engine::worker::WorkContext;
use crate::error::Result;
use crate::exec::MediaTransformer;
use crate::generators::{
    FlowSpec, LocalIngestGenerator, StorageObserver, WatchFolderGenerator, run_event_loop,
};
use crate::storage::StorageRegistry;
use crate::store::{TrackedItemStore, WorkflowStore};
use mediarelay_model::{StorageId, WorkFlow, WorkFlowId};

/// One engine instance: storages, stores, scheduler, and the spawned loops
/// that connect them. Multiple instances can coexist in one process; nothing
/// here is global.
pub struct RelayRuntime {
    config: RelayConfig,
    ctx: Arc<WorkContext>,
    workflows: Arc<dyn WorkflowStore>,
    dispatcher: Arc<Dispatcher>,
    bus: RelayEventBus,
    observers: Mutex<Vec<Arc<dyn StorageObserver>>>,
    sink_tx: mpsc::Sender<WorkFlow>,
    sink_rx: Mutex<Option<mpsc::Receiver<WorkFlow>>>,
    dropped_submissions: Arc<AtomicU64>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayRuntime {
    pub fn new(
        config: RelayConfig,
        storages: StorageRegistry,
        tracked: Arc<dyn TrackedItemStore>,
        workflows: Arc<dyn WorkflowStore>,
        transformer: Arc<dyn MediaTransformer>,
    ) -> Self {
        let bus = RelayEventBus::default();
        let ctx = Arc::new(WorkContext {
            storages,
            tracked,
            transformer,
        });
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&workflows),
            Arc::clone(&ctx),
            bus.clone(),
            &config,
        ));
        let (sink_tx, sink_rx) = mpsc::channel(256);

        Self {
            config,
            ctx,
            workflows,
            dispatcher,
            bus,
            observers: Mutex::new(Vec::new()),
            sink_tx,
            sink_rx: Mutex::new(Some(sink_rx)),
            dropped_submissions: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.bus.subscribe()
    }

    /// Sender half of the submission channel, for custom generators.
    pub fn workflow_sink(&self) -> mpsc::Sender<WorkFlow> {
        self.sink_tx.clone()
    }

    /// Register a single-storage ingest flow (no destination).
    pub async fn add_ingest_flow(&self, storage_id: &StorageId) -> Result<()> {
        let storage = self.ctx.storages.get(storage_id)?;
        let generator = LocalIngestGenerator::new(
            storage,
            Arc::clone(&self.ctx.tracked),
            self.sink_tx.clone(),
            self.config.linger.tracked_linger_ms,
        )?;
        self.observers.lock().await.push(Arc::new(generator));
        Ok(())
    }

    /// Register a source/destination watch flow.
    pub async fn add_watch_flow(&self, spec: FlowSpec) -> Result<()> {
        let source = self.ctx.storages.get(&spec.source)?;
        let target = self.ctx.storages.get(&spec.target)?;
        let generator = WatchFolderGenerator::new(
            source,
            target,
            Arc::clone(&self.ctx.tracked),
            self.sink_tx.clone(),
            self.config.linger.tracked_linger_ms,
            spec.cron,
        )?;
        self.observers.lock().await.push(Arc::new(generator));
        Ok(())
    }

    /// Register many flows. A misconfigured flow is logged and skipped;
    /// the remaining flows continue.
    pub async fn configure_flows(&self, specs: Vec<FlowSpec>) {
        for spec in specs {
            let describe = format!("{} -> {}", spec.source, spec.target);
            if let Err(err) = self.add_watch_flow(spec).await {
                warn!(
                    target: "relay::runtime",
                    flow = %describe,
                    error = %err,
                    "skipping misconfigured flow"
                );
            }
        }
    }

    /// Recover persisted state and spawn all engine loops.
    pub async fn start(&self) -> Result<()> {
        self.dispatcher.recover().await?;

        let mut handles = self.handles.lock().await;

        // worker events -> dispatcher
        if let Some(mut rx) = self.dispatcher.take_step_events().await {
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => {
                                if let Err(err) = dispatcher.handle_step_event(event).await {
                                    warn!(
                                        target: "relay::runtime",
                                        error = %err,
                                        "step event handling failed"
                                    );
                                }
                            }
                            None => break,
                        }
                    }
                }
            }));
        }

        // generator submissions -> dispatcher, with a single retry before
        // dropping (the generators' mark-and-sweep re-derives dropped work)
        if let Some(mut rx) = self.sink_rx.lock().await.take() {
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = self.shutdown.clone();
            let dropped = Arc::clone(&self.dropped_submissions);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        workflow = rx.recv() => match workflow {
                            Some(workflow) => {
                                if let Err(err) = dispatcher.submit(workflow.clone()).await {
                                    warn!(
                                        target: "relay::runtime",
                                        workflow = %workflow.id,
                                        error = %err,
                                        "submit failed, retrying once"
                                    );
                                    tokio::time::sleep(Duration::from_millis(500)).await;
                                    if let Err(err) = dispatcher.submit(workflow.clone()).await {
                                        dropped.fetch_add(1, Ordering::Relaxed);
                                        warn!(
                                            target: "relay::runtime",
                                            workflow = %workflow.id,
                                            error = %err,
                                            "dropping workflow after failed resubmit"
                                        );
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                }
            }));
        }

        // one event loop per registered generator
        let observers: Vec<Arc<dyn StorageObserver>> =
            self.observers.lock().await.iter().map(Arc::clone).collect();
        for observer in &observers {
            let observer = Arc::clone(observer);
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                run_event_loop(observer, shutdown).await;
            }));
        }

        // periodic reconciliation audit over cron-enabled flows
        {
            let observers = observers.clone();
            let shutdown = self.shutdown.clone();
            let interval_ms = self.config.cron.interval_ms.max(1_000);
            handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(interval_ms));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // the initial sweep already covered the first pass
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            for observer in &observers {
                                match observer.audit().await {
                                    Ok(0) => {}
                                    Ok(emitted) => info!(
                                        target: "relay::runtime",
                                        storage = %observer.storage().storage_id(),
                                        emitted,
                                        "audit emitted repair workflows"
                                    ),
                                    Err(err) => warn!(
                                        target: "relay::runtime",
                                        storage = %observer.storage().storage_id(),
                                        error = %err,
                                        "audit failed"
                                    ),
                                }
                            }
                        }
                    }
                }
            }));
        }

        // housekeeping: purge lingering finished workflows and stale tracked
        // items (the latter through the owning generator, so implied cleanup
        // workflows still fire)
        {
            let workflows = Arc::clone(&self.workflows);
            let observers = observers.clone();
            let shutdown = self.shutdown.clone();
            let linger = self.config.linger;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(
                    linger.housekeeper_interval_ms.max(1_000),
                ));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let cutoff = Utc::now()
                                - chrono::Duration::milliseconds(linger.workflow_linger_ms as i64);
                            match workflows.purge_finished_before(cutoff).await {
                                Ok(0) => {}
                                Ok(purged) => debug!(
                                    target: "relay::runtime",
                                    purged,
                                    "purged finished workflows"
                                ),
                                Err(err) => warn!(
                                    target: "relay::runtime",
                                    error = %err,
                                    "workflow purge failed"
                                ),
                            }

                            for observer in &observers {
                                let storage_id = observer.storage().storage_id().clone();
                                let items = match observer
                                    .tracked()
                                    .get_all_from_storage(&storage_id)
                                    .await
                                {
                                    Ok(items) => items,
                                    Err(err) => {
                                        warn!(
                                            target: "relay::runtime",
                                            storage = %storage_id,
                                            error = %err,
                                            "stale item scan failed"
                                        );
                                        continue;
                                    }
                                };
                                let now = Utc::now();
                                for item in items {
                                    if item.is_stale(now) {
                                        debug!(
                                            target: "relay::runtime",
                                            file = %item.id,
                                            "purging stale tracked item"
                                        );
                                        if let Err(err) =
                                            observer.on_item_expired(&item.id).await
                                        {
                                            warn!(
                                                target: "relay::runtime",
                                                file = %item.id,
                                                error = %err,
                                                "stale item purge failed"
                                            );
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }));
        }

        info!(
            target: "relay::runtime",
            workers = self.dispatcher.workers().len(),
            flows = observers.len(),
            "engine started"
        );
        Ok(())
    }

    /// Stop all loops and drain the worker pool.
    pub async fn shutdown(&self) {
        info!(target: "relay::runtime", "engine shutting down");
        self.shutdown.cancel();

        futures::future::join_all(
            self.dispatcher
                .workers()
                .iter()
                .map(|worker| worker.wait_until_finished()),
        )
        .await;

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    // Remotely invokable control-plane surface.

    pub async fn status(&self) -> Result<StatusReport> {
        let mut report = self.dispatcher.status().await?;
        report.dropped_submissions = self.dropped_submissions.load(Ordering::Relaxed);
        if report.dropped_submissions > 0
            && report.severity < crate::engine::status::StatusSeverity::Warning
        {
            report.severity = crate::engine::status::StatusSeverity::Warning;
        }
        Ok(report)
    }

    pub async fn abort_workflow(&self, id: WorkFlowId) -> Result<()> {
        self.dispatcher.abort_workflow(id).await
    }

    pub async fn restart_workflow(&self, id: WorkFlowId) -> Result<()> {
        self.dispatcher.restart_workflow(id).await
    }

    pub async fn abort_all_workflows(&self) -> Result<()> {
        self.dispatcher.abort_all_workflows().await
    }

    pub async fn restart_all_workflows(&self) -> Result<()> {
        self.dispatcher.restart_all_workflows().await
    }
}

impl fmt::Debug for RelayRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayRuntime")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}
