//! Uniform capability surface over physical storage locations.
//!
//! Workers and generators only ever talk to [`StorageHandler`] trait objects;
//! copy strategy is selected via the `supports_direct_copy` capability flag,
//! never by inspecting a concrete backend type.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use mediarelay_model::{ItemId, StorageId};

pub mod local;

pub use local::LocalStorageHandler;

/// Originating storage-type tag carried by every file handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    LocalFolder,
    FileShare,
    HttpGateway,
}

/// Properties of a file as observed on a storage.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FileProperties {
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Aggregate usage numbers a handler may be able to compute for health
/// reporting.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StorageUsage {
    pub total_bytes: u64,
    pub file_count: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEventKind {
    Add,
    Change,
    Delete,
}

/// Change notification emitted by a storage handler's watch stream.
#[derive(Clone, Debug)]
pub struct StorageEvent {
    pub kind: StorageEventKind,
    pub storage_id: StorageId,
    pub name: ItemId,
}

/// Handle to a file as it exists on one storage.
#[derive(Clone, Debug)]
pub struct StorageFile {
    /// Storage-relative name; doubles as the logical item id.
    pub name: ItemId,
    pub storage_id: StorageId,
    pub kind: StorageKind,
    /// Resolved filesystem path for storages that expose one. External
    /// transformation commands run against this path.
    pub local_path: Option<PathBuf>,
}

/// Readable byte stream over a file's content.
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// Progress callback invoked with values in [0.0, 1.0].
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Options threaded through copy operations: an optional progress callback
/// plus the cancellation token registered as the worker's in-flight cancel
/// hook.
#[derive(Clone, Default)]
pub struct PutOptions {
    pub progress: Option<ProgressFn>,
    pub cancel: CancellationToken,
}

impl PutOptions {
    pub fn with_progress(progress: ProgressFn) -> Self {
        Self {
            progress: Some(progress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn report(&self, value: f64) {
        if let Some(progress) = &self.progress {
            progress(value.clamp(0.0, 1.0));
        }
    }
}

impl fmt::Debug for PutOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutOptions")
            .field("has_progress", &self.progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Uniform contract over a physical storage location.
///
/// Handlers are safe for concurrent use by multiple workers operating on
/// different files; the dispatcher guarantees a single file is never assigned
/// to two workers at once.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    fn storage_id(&self) -> &StorageId;

    fn kind(&self) -> StorageKind;

    fn supports_read(&self) -> bool;

    fn supports_write(&self) -> bool;

    /// Whether [`StorageHandler::copy_direct`] offers a fast same-type copy
    /// path. When false, workers fall back to the generic stream copy via
    /// [`StorageHandler::put_file`].
    fn supports_direct_copy(&self) -> bool {
        false
    }

    async fn list_all_files(&self) -> Result<Vec<StorageFile>>;

    /// Resolve a file by storage-relative name. Returns
    /// [`RelayError::NotFound`] when the file does not exist.
    async fn get_file(&self, name: &ItemId) -> Result<StorageFile>;

    async fn get_file_properties(&self, file: &StorageFile) -> Result<FileProperties>;

    async fn open_read(&self, file: &StorageFile) -> Result<FileReader>;

    /// Copy a byte stream into this storage under `name`, reporting progress
    /// against `size` and honoring cancellation. Returns the landed file.
    async fn put_file(
        &self,
        name: &ItemId,
        reader: FileReader,
        size: u64,
        options: &PutOptions,
    ) -> Result<StorageFile>;

    /// Fast copy path for handlers that can reach the source file natively.
    /// Only called when `supports_direct_copy()` is true.
    async fn copy_direct(
        &self,
        _source: &StorageFile,
        _options: &PutOptions,
    ) -> Result<StorageFile> {
        Err(RelayError::Storage(
            "direct copy not supported by this storage".into(),
        ))
    }

    async fn delete_file(&self, file: &StorageFile) -> Result<()>;

    /// Watch hints only; handlers may ignore them.
    async fn add_monitored_file(&self, _name: &ItemId) {}

    async fn remove_monitored_file(&self, _name: &ItemId) {}

    /// Subscribe to add/change/delete notifications for this storage.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;

    /// Optional usage probe for health reporting.
    async fn usage(&self) -> Result<Option<StorageUsage>> {
        Ok(None)
    }
}

/// Storage handlers known to one engine instance, keyed by storage id.
/// Owned and passed explicitly; no process-wide registry exists.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    handlers: HashMap<StorageId, Arc<dyn StorageHandler>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handler: Arc<dyn StorageHandler>) {
        self.handlers.insert(handler.storage_id().clone(), handler);
    }

    pub fn get(&self, id: &StorageId) -> Result<Arc<dyn StorageHandler>> {
        self.handlers
            .get(id)
            .cloned()
            .ok_or_else(|| RelayError::NotFound(format!("storage {id} is not registered")))
    }

    pub fn ids(&self) -> impl Iterator<Item = &StorageId> {
        self.handlers.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StorageId, &Arc<dyn StorageHandler>)> {
        self.handlers.iter()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRegistry")
            .field("storage_ids", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
