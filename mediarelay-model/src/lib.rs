//! Core data model definitions shared across mediarelay crates.
//!
//! Everything in this crate is pure data: the persisted document shapes for
//! workflows, steps, and tracked media items, plus the validity rules that
//! belong to the documents themselves. Behavior lives in `mediarelay-core`.

pub mod ids;
pub mod tracked;
pub mod workflow;

pub use ids::{ItemId, StorageId, WorkFlowId, WorkStepId};
pub use tracked::{Attachment, AttachmentKind, TrackedMediaItem};
pub use workflow::{
    WorkFlow, WorkFlowSource, WorkResult, WorkStep, WorkStepAction,
    WorkStepStatus,
};
