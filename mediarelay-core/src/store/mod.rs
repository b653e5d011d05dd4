//! Persistence contracts for workflows, tracked items, and attachments.
//!
//! Both stores promise atomic per-document updates; the dispatcher and the
//! generators never need cross-document transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use mediarelay_model::{Attachment, ItemId, StorageId, TrackedMediaItem, WorkFlow, WorkFlowId};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::{InMemoryTrackedItemStore, InMemoryWorkflowStore};
#[cfg(feature = "database")]
pub use postgres::{PostgresTrackedItemStore, PostgresWorkflowStore};

/// Read-modify-write mutator applied under the store's per-id lock. Returning
/// `None` leaves the item untracked (an existing record is removed).
pub type TrackedItemMutator =
    Box<dyn FnOnce(Option<TrackedMediaItem>) -> Option<TrackedMediaItem> + Send>;

/// Durable record of which storage each known file lives on and which
/// destinations have received a copy. Last-writer-wins per id.
#[async_trait]
pub trait TrackedItemStore: Send + Sync {
    async fn put(&self, item: TrackedMediaItem) -> Result<()>;

    async fn get_by_id(&self, id: &ItemId) -> Result<Option<TrackedMediaItem>>;

    async fn get_all_from_storage(&self, storage_id: &StorageId)
    -> Result<Vec<TrackedMediaItem>>;

    async fn remove(&self, id: &ItemId) -> Result<()>;

    /// Read-modify-write upsert. The mutator observes the current record (or
    /// `None`) and returns the record to persist, or `None` to leave the item
    /// untracked. Returns the persisted record.
    async fn upsert(
        &self,
        id: &ItemId,
        mutator: TrackedItemMutator,
    ) -> Result<Option<TrackedMediaItem>>;

    async fn put_attachment(&self, item_id: &ItemId, attachment: Attachment) -> Result<()>;

    async fn get_attachments(&self, item_id: &ItemId) -> Result<Vec<Attachment>>;

    async fn remove_attachments(&self, item_id: &ItemId) -> Result<()>;
}

/// Persisted workflow documents. State must survive process restarts.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn insert(&self, workflow: &WorkFlow) -> Result<()>;

    /// Replace the whole document. Atomic per workflow id.
    async fn update(&self, workflow: &WorkFlow) -> Result<()>;

    async fn get(&self, id: WorkFlowId) -> Result<Option<WorkFlow>>;

    /// All workflows not yet finished.
    async fn load_open(&self) -> Result<Vec<WorkFlow>>;

    async fn load_all(&self) -> Result<Vec<WorkFlow>>;

    async fn remove(&self, id: WorkFlowId) -> Result<()>;

    /// Purge workflows that finished before `cutoff`. Returns the number of
    /// documents removed.
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
