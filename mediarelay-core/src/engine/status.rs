//! Aggregate health reporting for the control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageUsage;
use mediarelay_model::{StorageId, WorkFlowId, WorkStepAction, WorkStepId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSeverity {
    Good,
    Warning,
    Bad,
}

/// A step that has been working longer than the configured liveness
/// threshold. Reported, never auto-killed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckStepWarning {
    pub workflow_id: WorkFlowId,
    pub step_id: WorkStepId,
    pub action: WorkStepAction,
    pub running_for_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub storage_id: StorageId,
    /// None when the handler cannot compute usage.
    pub usage: Option<StorageUsage>,
    pub reachable: bool,
}

/// Snapshot of engine health at one instant.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub severity: StatusSeverity,
    pub sampled_at: DateTime<Utc>,
    pub workers_total: usize,
    pub workers_busy: usize,
    /// Idle steps awaiting a worker across all open workflows.
    pub queue_depth: usize,
    pub open_workflows: usize,
    /// Workflows dropped because persistence kept failing on submit.
    #[serde(default)]
    pub dropped_submissions: u64,
    pub stuck_steps: Vec<StuckStepWarning>,
    pub storages: Vec<StorageStatus>,
}
