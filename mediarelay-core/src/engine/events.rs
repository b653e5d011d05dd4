//! In-process event plumbing for the engine.
//!
//! Worker tasks report back to the dispatch loop over a point-to-point mpsc
//! queue; engine lifecycle notifications fan out to observers over a typed
//! broadcast bus with explicit capacity.

use std::fmt;

use tokio::sync::broadcast;

use mediarelay_model::{WorkFlowId, WorkResult, WorkStepId, WorkStepStatus};

/// Messages from worker tasks back to the dispatch loop.
#[derive(Debug)]
pub enum StepEvent {
    Progress {
        workflow_id: WorkFlowId,
        step_id: WorkStepId,
        progress: f64,
    },
    Finished {
        workflow_id: WorkFlowId,
        step_id: WorkStepId,
        result: WorkResult,
    },
}

/// Lifecycle notifications observable by the control plane and tests.
#[derive(Clone, Debug)]
pub enum RelayEvent {
    WorkflowSubmitted {
        workflow_id: WorkFlowId,
    },
    StepCompleted {
        workflow_id: WorkFlowId,
        step_id: WorkStepId,
        status: WorkStepStatus,
    },
    WorkflowFinished {
        workflow_id: WorkFlowId,
        success: bool,
    },
}

/// Lightweight in-process fan-out of engine notifications.
#[derive(Clone)]
pub struct RelayEventBus {
    sender: broadcast::Sender<RelayEvent>,
    capacity: usize,
}

impl RelayEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RelayEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for RelayEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for RelayEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
