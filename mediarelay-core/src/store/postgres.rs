//! Postgres-backed document stores.
//!
//! Each workflow and tracked item is one row holding the serialized document;
//! updates replace the whole document under its primary key, which gives the
//! atomic per-document semantics the dispatcher relies on.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::error::{RelayError, Result};
use crate::store::{TrackedItemMutator, TrackedItemStore, WorkflowStore};
use mediarelay_model::{
    Attachment, AttachmentKind, ItemId, StorageId, TrackedMediaItem, WorkFlow, WorkFlowId,
};

async fn health_check(pool: &PgPool, what: &str) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| {
            RelayError::Internal(format!("{what} failed Postgres health check: {e}"))
        })?;
    Ok(())
}

#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    pub async fn new(pool: PgPool) -> Result<Self> {
        health_check(&pool, "workflow store").await?;
        info!(target: "relay::store", "workflow store connected to Postgres");
        Ok(Self { pool })
    }
}

impl fmt::Debug for PostgresWorkflowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresWorkflowStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    async fn insert(&self, workflow: &WorkFlow) -> Result<()> {
        let doc = serde_json::to_value(workflow)?;
        // idempotent so the submission loop can safely resubmit after a
        // transient failure
        sqlx::query(
            r#"
            INSERT INTO relay_workflows (id, doc, finished, finished_at, created_at, updated_at)
            VALUES ($1, $2, $3, CASE WHEN $3 THEN NOW() END, $4, NOW())
            ON CONFLICT (id) DO UPDATE SET
                doc = EXCLUDED.doc,
                finished = EXCLUDED.finished,
                updated_at = NOW()
            "#,
        )
        .bind(workflow.id.0)
        .bind(&doc)
        .bind(workflow.finished)
        .bind(workflow.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, workflow: &WorkFlow) -> Result<()> {
        let doc = serde_json::to_value(workflow)?;
        sqlx::query(
            r#"
            UPDATE relay_workflows
            SET doc = $2,
                finished = $3,
                finished_at = CASE WHEN $3 THEN COALESCE(finished_at, NOW()) END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(workflow.id.0)
        .bind(&doc)
        .bind(workflow.finished)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: WorkFlowId) -> Result<Option<WorkFlow>> {
        let row = sqlx::query("SELECT doc FROM relay_workflows WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let doc: serde_json::Value = r.get("doc");
            serde_json::from_value(doc).map_err(RelayError::from)
        })
        .transpose()
    }

    async fn load_open(&self) -> Result<Vec<WorkFlow>> {
        let rows =
            sqlx::query("SELECT doc FROM relay_workflows WHERE NOT finished ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|r| {
                let doc: serde_json::Value = r.get("doc");
                serde_json::from_value(doc).map_err(RelayError::from)
            })
            .collect()
    }

    async fn load_all(&self) -> Result<Vec<WorkFlow>> {
        let rows = sqlx::query("SELECT doc FROM relay_workflows ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                let doc: serde_json::Value = r.get("doc");
                serde_json::from_value(doc).map_err(RelayError::from)
            })
            .collect()
    }

    async fn remove(&self, id: WorkFlowId) -> Result<()> {
        sqlx::query("DELETE FROM relay_workflows WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM relay_workflows WHERE finished AND finished_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Clone)]
pub struct PostgresTrackedItemStore {
    pool: PgPool,
}

impl PostgresTrackedItemStore {
    pub async fn new(pool: PgPool) -> Result<Self> {
        health_check(&pool, "tracked-item store").await?;
        info!(target: "relay::store", "tracked-item store connected to Postgres");
        Ok(Self { pool })
    }
}

impl fmt::Debug for PostgresTrackedItemStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresTrackedItemStore")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

fn attachment_kind_from_str(kind: &str) -> Result<AttachmentKind> {
    match kind {
        "scan" => Ok(AttachmentKind::Scan),
        "metadata" => Ok(AttachmentKind::Metadata),
        "thumbnail" => Ok(AttachmentKind::Thumbnail),
        "preview" => Ok(AttachmentKind::Preview),
        other => Err(RelayError::Internal(format!(
            "unknown attachment kind {other}"
        ))),
    }
}

#[async_trait]
impl TrackedItemStore for PostgresTrackedItemStore {
    async fn put(&self, item: TrackedMediaItem) -> Result<()> {
        let doc = serde_json::to_value(&item)?;
        sqlx::query(
            r#"
            INSERT INTO relay_tracked_items (id, storage_id, doc, last_seen)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                storage_id = EXCLUDED.storage_id,
                doc = EXCLUDED.doc,
                last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(item.id.as_str())
        .bind(item.source_storage_id.as_str())
        .bind(&doc)
        .bind(item.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &ItemId) -> Result<Option<TrackedMediaItem>> {
        let row = sqlx::query("SELECT doc FROM relay_tracked_items WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let doc: serde_json::Value = r.get("doc");
            serde_json::from_value(doc).map_err(RelayError::from)
        })
        .transpose()
    }

    async fn get_all_from_storage(
        &self,
        storage_id: &StorageId,
    ) -> Result<Vec<TrackedMediaItem>> {
        let rows = sqlx::query("SELECT doc FROM relay_tracked_items WHERE storage_id = $1")
            .bind(storage_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                let doc: serde_json::Value = r.get("doc");
                serde_json::from_value(doc).map_err(RelayError::from)
            })
            .collect()
    }

    async fn remove(&self, id: &ItemId) -> Result<()> {
        sqlx::query("DELETE FROM relay_tracked_items WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert(
        &self,
        id: &ItemId,
        mutator: TrackedItemMutator,
    ) -> Result<Option<TrackedMediaItem>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT doc FROM relay_tracked_items WHERE id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let current: Option<TrackedMediaItem> = row
            .map(|r| {
                let doc: serde_json::Value = r.get("doc");
                serde_json::from_value(doc).map_err(RelayError::from)
            })
            .transpose()?;

        let outcome = match mutator(current) {
            Some(item) => {
                let doc = serde_json::to_value(&item)?;
                sqlx::query(
                    r#"
                    INSERT INTO relay_tracked_items (id, storage_id, doc, last_seen)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (id) DO UPDATE SET
                        storage_id = EXCLUDED.storage_id,
                        doc = EXCLUDED.doc,
                        last_seen = EXCLUDED.last_seen
                    "#,
                )
                .bind(item.id.as_str())
                .bind(item.source_storage_id.as_str())
                .bind(&doc)
                .bind(item.last_seen)
                .execute(&mut *tx)
                .await?;
                Some(item)
            }
            None => {
                sqlx::query("DELETE FROM relay_tracked_items WHERE id = $1")
                    .bind(id.as_str())
                    .execute(&mut *tx)
                    .await?;
                None
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn put_attachment(&self, item_id: &ItemId, attachment: Attachment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO relay_attachments (item_id, att_id, kind, content_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (item_id, att_id) DO UPDATE SET
                kind = EXCLUDED.kind,
                content_type = EXCLUDED.content_type,
                payload = EXCLUDED.payload,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(item_id.as_str())
        .bind(&attachment.id)
        .bind(attachment.kind.as_str())
        .bind(&attachment.content_type)
        .bind(&attachment.payload)
        .bind(attachment.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_attachments(&self, item_id: &ItemId) -> Result<Vec<Attachment>> {
        let rows = sqlx::query(
            r#"
            SELECT att_id, kind, content_type, payload, created_at
            FROM relay_attachments
            WHERE item_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(item_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                let kind: String = r.get("kind");
                Ok(Attachment {
                    id: r.get("att_id"),
                    kind: attachment_kind_from_str(&kind)?,
                    content_type: r.get("content_type"),
                    payload: r.get("payload"),
                    created: r.get("created_at"),
                })
            })
            .collect()
    }

    async fn remove_attachments(&self, item_id: &ItemId) -> Result<()> {
        sqlx::query("DELETE FROM relay_attachments WHERE item_id = $1")
            .bind(item_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
