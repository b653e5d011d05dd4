//! Hand-written stubs shared by the engine and generator tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::{RwLock, broadcast};

use crate::error::{RelayError, Result};
use crate::exec::MediaTransformer;
use crate::storage::{
    FileProperties, FileReader, PutOptions, StorageEvent, StorageEventKind,
    StorageFile, StorageHandler, StorageKind, StorageUsage,
};
use mediarelay_model::{ItemId, StorageId, TrackedMediaItem};

pub(crate) fn tracked_item(name: &str, storage: &str) -> TrackedMediaItem {
    TrackedMediaItem::new(ItemId::from(name), StorageId::from(storage), 60_000)
}

/// In-memory storage handler with togglable failure modes.
pub(crate) struct MemoryStorageHandler {
    storage_id: StorageId,
    files: RwLock<HashMap<ItemId, Vec<u8>>>,
    events: broadcast::Sender<StorageEvent>,
    fail_puts: AtomicBool,
    read_only: AtomicBool,
    put_delay_ms: AtomicU64,
}

impl MemoryStorageHandler {
    pub(crate) fn new(id: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            storage_id: StorageId::from(id),
            files: RwLock::new(HashMap::new()),
            events,
            fail_puts: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            put_delay_ms: AtomicU64::new(0),
        })
    }

    pub(crate) async fn seed(&self, name: &str, bytes: Vec<u8>) {
        self.files.write().await.insert(ItemId::from(name), bytes);
    }

    pub(crate) async fn remove(&self, name: &str) {
        self.files.write().await.remove(&ItemId::from(name));
    }

    pub(crate) async fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.files.read().await.get(&ItemId::from(name)).cloned()
    }

    pub(crate) fn fail_puts(&self, value: bool) {
        self.fail_puts.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_put_delay_ms(&self, value: u64) {
        self.put_delay_ms.store(value, Ordering::SeqCst);
    }

    pub(crate) fn set_read_only(&self, value: bool) {
        self.read_only.store(value, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, kind: StorageEventKind, name: &str) {
        let _ = self.events.send(StorageEvent {
            kind,
            storage_id: self.storage_id.clone(),
            name: ItemId::from(name),
        });
    }

    fn handle(&self, name: ItemId) -> StorageFile {
        let path = PathBuf::from(format!("/mem/{}/{}", self.storage_id, name));
        StorageFile {
            name,
            storage_id: self.storage_id.clone(),
            kind: StorageKind::LocalFolder,
            local_path: Some(path),
        }
    }
}

#[async_trait]
impl StorageHandler for MemoryStorageHandler {
    fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    fn kind(&self) -> StorageKind {
        StorageKind::LocalFolder
    }

    fn supports_read(&self) -> bool {
        true
    }

    fn supports_write(&self) -> bool {
        !self.read_only.load(Ordering::SeqCst)
    }

    async fn list_all_files(&self) -> Result<Vec<StorageFile>> {
        Ok(self
            .files
            .read()
            .await
            .keys()
            .cloned()
            .map(|name| self.handle(name))
            .collect())
    }

    async fn get_file(&self, name: &ItemId) -> Result<StorageFile> {
        if self.files.read().await.contains_key(name) {
            Ok(self.handle(name.clone()))
        } else {
            Err(RelayError::NotFound(format!(
                "{name} on storage {}",
                self.storage_id
            )))
        }
    }

    async fn get_file_properties(&self, file: &StorageFile) -> Result<FileProperties> {
        let files = self.files.read().await;
        let bytes = files.get(&file.name).ok_or_else(|| {
            RelayError::NotFound(format!("{} on storage {}", file.name, self.storage_id))
        })?;
        Ok(FileProperties {
            size: bytes.len() as u64,
            created_at: None,
            modified_at: None,
        })
    }

    async fn open_read(&self, file: &StorageFile) -> Result<FileReader> {
        let files = self.files.read().await;
        let bytes = files.get(&file.name).ok_or_else(|| {
            RelayError::NotFound(format!("{} on storage {}", file.name, self.storage_id))
        })?;
        Ok(Box::new(std::io::Cursor::new(bytes.clone())))
    }

    async fn put_file(
        &self,
        name: &ItemId,
        mut reader: FileReader,
        size: u64,
        options: &PutOptions,
    ) -> Result<StorageFile> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(RelayError::Storage(format!(
                "injected put failure on {}",
                self.storage_id
            )));
        }

        let delay = self.put_delay_ms.load(Ordering::SeqCst);
        let mut waited = 0u64;
        while waited < delay {
            if options.cancel.is_cancelled() {
                return Err(RelayError::Cancelled(format!("copy of {name} aborted")));
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            waited += 10;
        }

        let mut collected = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if options.cancel.is_cancelled() {
                return Err(RelayError::Cancelled(format!("copy of {name} aborted")));
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
            if size > 0 {
                options.report(collected.len() as f64 / size as f64);
            }
        }
        options.report(1.0);

        self.files.write().await.insert(name.clone(), collected);
        Ok(self.handle(name.clone()))
    }

    async fn delete_file(&self, file: &StorageFile) -> Result<()> {
        self.files.write().await.remove(&file.name);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    async fn usage(&self) -> Result<Option<StorageUsage>> {
        let files = self.files.read().await;
        Ok(Some(StorageUsage {
            total_bytes: files.values().map(|b| b.len() as u64).sum(),
            file_count: files.len() as u64,
        }))
    }
}

/// Transformer returning canned payloads, with a togglable metadata failure.
#[derive(Default)]
pub(crate) struct StubTransformer {
    fail_metadata: AtomicBool,
}

impl StubTransformer {
    pub(crate) fn fail_metadata(&self, value: bool) {
        self.fail_metadata.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaTransformer for StubTransformer {
    async fn scan(&self, _path: &std::path::Path) -> Result<serde_json::Value> {
        Ok(serde_json::json!({ "streams": [] }))
    }

    async fn metadata(&self, _path: &std::path::Path) -> Result<serde_json::Value> {
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(RelayError::Command("injected metadata failure".into()));
        }
        Ok(serde_json::json!({ "format": { "format_name": "mxf" } }))
    }

    async fn thumbnail(&self, _path: &std::path::Path) -> Result<Vec<u8>> {
        Ok(b"thumbnail-bytes".to_vec())
    }

    async fn preview(&self, _path: &std::path::Path) -> Result<Vec<u8>> {
        Ok(b"preview-bytes".to_vec())
    }
}
