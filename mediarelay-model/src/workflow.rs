use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, StorageId, WorkFlowId, WorkStepId};

/// Records why a workflow was created.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkFlowSource {
    ExpectedMediaItem,
    SourceStorageRemove,
    LocalMediaItem,
    TargetStorageRemove,
}

/// The schedulable action a step performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkStepAction {
    Copy,
    Delete,
    Scan,
    GenerateThumbnail,
    GenerateMetadata,
    GeneratePreview,
}

impl WorkStepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStepAction::Copy => "copy",
            WorkStepAction::Delete => "delete",
            WorkStepAction::Scan => "scan",
            WorkStepAction::GenerateThumbnail => "generate-thumbnail",
            WorkStepAction::GenerateMetadata => "generate-metadata",
            WorkStepAction::GeneratePreview => "generate-preview",
        }
    }
}

/// Step states. `Blocked` is derived from a preceding critical failure and is
/// never assigned by generators.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStepStatus {
    Idle,
    Working,
    Done,
    Error,
    Canceled,
    Skipped,
    Blocked,
}

impl WorkStepStatus {
    /// Terminal states end a step's lifecycle; a workflow is finished once
    /// every step is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkStepStatus::Done
                | WorkStepStatus::Error
                | WorkStepStatus::Canceled
                | WorkStepStatus::Skipped
        )
    }
}

/// One schedulable action inside a workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkStep {
    pub id: WorkStepId,
    pub action: WorkStepAction,
    pub status: WorkStepStatus,
    /// Orders steps within and across workflows; higher runs first.
    pub priority: f64,
    /// Monotonically non-decreasing in [0.0, 1.0] while working.
    pub progress: f64,
    pub critical_step: bool,
    pub messages: Vec<String>,
    /// Advisory estimate of remaining duration, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_left: Option<f64>,
    /// Logical name of the file the step operates on.
    pub file_name: ItemId,
    /// Target storage for copy/delete actions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_storage_id: Option<StorageId>,
}

impl WorkStep {
    pub fn new(action: WorkStepAction, file_name: ItemId, priority: f64) -> Self {
        Self {
            id: WorkStepId::new(),
            action,
            status: WorkStepStatus::Idle,
            priority,
            progress: 0.0,
            critical_step: false,
            messages: Vec::new(),
            expected_left: None,
            file_name,
            target_storage_id: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical_step = true;
        self
    }

    pub fn with_target(mut self, storage_id: StorageId) -> Self {
        self.target_storage_id = Some(storage_id);
        self
    }
}

/// Terminal outcome reported by a worker for one step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkResult {
    pub status: WorkStepStatus,
    pub messages: Vec<String>,
}

impl WorkResult {
    pub fn done() -> Self {
        Self {
            status: WorkStepStatus::Done,
            messages: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: WorkStepStatus::Error,
            messages: vec![message.into()],
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: WorkStepStatus::Canceled,
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }
}

/// A unit of intent spanning one or more ordered steps, persisted so state
/// survives process restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkFlow {
    pub id: WorkFlowId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub source: WorkFlowSource,
    pub steps: Vec<WorkStep>,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    /// Coarse tie-break between workflows; higher is more urgent.
    pub priority: f64,
    pub finished: bool,
    /// Meaningful only once `finished` is true.
    pub success: bool,
}

impl WorkFlow {
    pub fn new(source: WorkFlowSource, steps: Vec<WorkStep>, priority: f64) -> Self {
        Self {
            id: WorkFlowId::new(),
            name: None,
            comment: None,
            source,
            steps,
            created: Utc::now(),
            modified: None,
            priority,
            finished: false,
            success: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn step(&self, id: WorkStepId) -> Option<&WorkStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: WorkStepId) -> Option<&mut WorkStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Index of the first critical step that ended in error, if any.
    pub fn first_critical_error(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.critical_step && s.status == WorkStepStatus::Error)
    }

    /// A step is effectively blocked when it is idle and any preceding
    /// critical step in the same workflow has errored.
    pub fn is_step_blocked(&self, index: usize) -> bool {
        let Some(step) = self.steps.get(index) else {
            return false;
        };
        step.status == WorkStepStatus::Idle
            && self.steps[..index]
                .iter()
                .any(|s| s.critical_step && s.status == WorkStepStatus::Error)
    }

    /// Re-derive `finished`/`success` from step states and stamp `modified`.
    /// `finished` iff every step is terminal; `success` iff additionally no
    /// step errored.
    pub fn recompute_outcome(&mut self) {
        self.finished = self.steps.iter().all(|s| s.status.is_terminal());
        self.success = self.finished
            && !self
                .steps
                .iter()
                .any(|s| s.status == WorkStepStatus::Error);
        self.modified = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: WorkStepAction, status: WorkStepStatus, critical: bool) -> WorkStep {
        let mut step = WorkStep::new(action, ItemId::from("clip.mxf"), 1.0);
        step.status = status;
        step.critical_step = critical;
        step
    }

    #[test]
    fn finished_requires_all_steps_terminal() {
        let mut flow = WorkFlow::new(
            WorkFlowSource::LocalMediaItem,
            vec![
                step(WorkStepAction::Scan, WorkStepStatus::Done, false),
                step(WorkStepAction::GenerateThumbnail, WorkStepStatus::Working, false),
            ],
            0.0,
        );
        flow.recompute_outcome();
        assert!(!flow.finished);

        flow.steps[1].status = WorkStepStatus::Done;
        flow.recompute_outcome();
        assert!(flow.finished);
        assert!(flow.success);
    }

    #[test]
    fn any_error_clears_success() {
        let mut flow = WorkFlow::new(
            WorkFlowSource::ExpectedMediaItem,
            vec![
                step(WorkStepAction::Copy, WorkStepStatus::Error, true),
                step(WorkStepAction::Scan, WorkStepStatus::Skipped, false),
            ],
            0.0,
        );
        flow.recompute_outcome();
        assert!(flow.finished);
        assert!(!flow.success);
    }

    #[test]
    fn blocked_is_derived_from_preceding_critical_error() {
        let flow = WorkFlow::new(
            WorkFlowSource::ExpectedMediaItem,
            vec![
                step(WorkStepAction::Copy, WorkStepStatus::Error, true),
                step(WorkStepAction::Scan, WorkStepStatus::Idle, false),
            ],
            0.0,
        );
        assert!(!flow.is_step_blocked(0));
        assert!(flow.is_step_blocked(1));
    }

    #[test]
    fn step_documents_serialize_with_camel_case_fields() {
        let step = WorkStep::new(WorkStepAction::Copy, ItemId::from("a.mxf"), 2.0)
            .critical()
            .with_target(StorageId::from("playout"));
        let doc = serde_json::to_value(&step).unwrap();
        assert_eq!(doc["action"], "copy");
        assert_eq!(doc["criticalStep"], true);
        assert_eq!(doc["targetStorageId"], "playout");
        assert_eq!(doc["fileName"], "a.mxf");
    }
}
