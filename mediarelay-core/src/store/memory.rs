//! In-memory stores used by tests and single-process deployments without a
//! database. Same contracts as the Postgres-backed stores.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::{TrackedItemMutator, TrackedItemStore, WorkflowStore};
use mediarelay_model::{Attachment, ItemId, StorageId, TrackedMediaItem, WorkFlow, WorkFlowId};

#[derive(Default)]
pub struct InMemoryTrackedItemStore {
    items: RwLock<HashMap<ItemId, TrackedMediaItem>>,
    attachments: RwLock<HashMap<ItemId, Vec<Attachment>>>,
}

impl InMemoryTrackedItemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for InMemoryTrackedItemStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTrackedItemStore").finish()
    }
}

#[async_trait]
impl TrackedItemStore for InMemoryTrackedItemStore {
    async fn put(&self, item: TrackedMediaItem) -> Result<()> {
        self.items.write().await.insert(item.id.clone(), item);
        Ok(())
    }

    async fn get_by_id(&self, id: &ItemId) -> Result<Option<TrackedMediaItem>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn get_all_from_storage(
        &self,
        storage_id: &StorageId,
    ) -> Result<Vec<TrackedMediaItem>> {
        Ok(self
            .items
            .read()
            .await
            .values()
            .filter(|item| &item.source_storage_id == storage_id)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &ItemId) -> Result<()> {
        self.items.write().await.remove(id);
        Ok(())
    }

    async fn upsert(
        &self,
        id: &ItemId,
        mutator: TrackedItemMutator,
    ) -> Result<Option<TrackedMediaItem>> {
        let mut items = self.items.write().await;
        let current = items.get(id).cloned();
        match mutator(current) {
            Some(item) => {
                items.insert(id.clone(), item.clone());
                Ok(Some(item))
            }
            None => {
                items.remove(id);
                Ok(None)
            }
        }
    }

    async fn put_attachment(&self, item_id: &ItemId, attachment: Attachment) -> Result<()> {
        let mut attachments = self.attachments.write().await;
        let entries = attachments.entry(item_id.clone()).or_default();
        entries.retain(|existing| existing.id != attachment.id);
        entries.push(attachment);
        Ok(())
    }

    async fn get_attachments(&self, item_id: &ItemId) -> Result<Vec<Attachment>> {
        Ok(self
            .attachments
            .read()
            .await
            .get(item_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_attachments(&self, item_id: &ItemId) -> Result<()> {
        self.attachments.write().await.remove(item_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflows: RwLock<HashMap<WorkFlowId, WorkFlow>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for InMemoryWorkflowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryWorkflowStore").finish()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn insert(&self, workflow: &WorkFlow) -> Result<()> {
        self.workflows
            .write()
            .await
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn update(&self, workflow: &WorkFlow) -> Result<()> {
        self.workflows
            .write()
            .await
            .insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get(&self, id: WorkFlowId) -> Result<Option<WorkFlow>> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn load_open(&self) -> Result<Vec<WorkFlow>> {
        Ok(self
            .workflows
            .read()
            .await
            .values()
            .filter(|wf| !wf.finished)
            .cloned()
            .collect())
    }

    async fn load_all(&self) -> Result<Vec<WorkFlow>> {
        Ok(self.workflows.read().await.values().cloned().collect())
    }

    async fn remove(&self, id: WorkFlowId) -> Result<()> {
        self.workflows.write().await.remove(&id);
        Ok(())
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut workflows = self.workflows.write().await;
        let before = workflows.len();
        workflows.retain(|_, wf| {
            let finished_at = wf.modified.unwrap_or(wf.created);
            !(wf.finished && finished_at < cutoff)
        });
        Ok((before - workflows.len()) as u64)
    }
}
