//! Local-folder storage backend.
//!
//! A thin wrapper around the filesystem plus `notify`: raw notifications are
//! debounced into batches before being fanned out as [`StorageEvent`]s, so a
//! burst of writes to one file surfaces as a single change.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::warn;

use crate::config::WatchConfig;
use crate::error::{RelayError, Result};
use crate::storage::{
    FileProperties, FileReader, PutOptions, StorageEvent, StorageEventKind,
    StorageFile, StorageHandler, StorageKind, StorageUsage,
};
use async_trait::async_trait;
use mediarelay_model::{ItemId, StorageId};

const COPY_CHUNK_SIZE: usize = 256 * 1024;

/// Storage handler over a local directory tree.
pub struct LocalStorageHandler {
    storage_id: StorageId,
    root: PathBuf,
    config: WatchConfig,
    events: broadcast::Sender<StorageEvent>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    monitored: Mutex<HashSet<ItemId>>,
}

impl LocalStorageHandler {
    pub fn new(storage_id: StorageId, root: impl Into<PathBuf>, config: WatchConfig) -> Self {
        let capacity = config.max_batch_events.max(64);
        let (events, _) = broadcast::channel(capacity);
        Self {
            storage_id,
            root: root.into(),
            config,
            events,
            watcher: Mutex::new(None),
            flush_task: Mutex::new(None),
            monitored: Mutex::new(HashSet::new()),
        }
    }

    /// Attach a recursive notify watcher to the root and start the debounce
    /// loop. Idempotent.
    pub async fn start_watching(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.watcher.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let capacity = self.config.max_batch_events.max(64) * 4;
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>(capacity);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Dropped events surface as a lagged receiver downstream; the
            // generators resweep on lag.
            let _ = tx.blocking_send(res);
        })
        .map_err(|e| RelayError::Storage(format!("failed to initialize watcher: {e}")))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| {
                RelayError::Storage(format!(
                    "failed to watch {}: {e}",
                    self.root.display()
                ))
            })?;

        *guard = Some(watcher);

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.flush_loop(rx).await });
        *self.flush_task.lock().await = Some(handle);

        Ok(())
    }

    /// Detach the watcher and stop the debounce loop.
    pub async fn stop_watching(&self) {
        // Dropping the watcher stops the notify stream, which ends the flush
        // loop once its channel drains.
        self.watcher.lock().await.take();
        if let Some(handle) = self.flush_task.lock().await.take() {
            handle.abort();
        }
    }

    async fn flush_loop(self: Arc<Self>, mut rx: mpsc::Receiver<notify::Result<Event>>) {
        let window = Duration::from_millis(self.config.debounce_window_ms.max(1));
        let mut pending: HashMap<ItemId, StorageEventKind> = HashMap::new();

        loop {
            let msg = if pending.is_empty() {
                rx.recv().await
            } else {
                match timeout(window, rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        self.flush(&mut pending);
                        continue;
                    }
                }
            };

            match msg {
                Some(Ok(event)) => {
                    for (name, kind) in self.classify(event).await {
                        pending
                            .entry(name)
                            .and_modify(|existing| *existing = merge_kinds(*existing, kind))
                            .or_insert(kind);
                    }
                    if pending.len() >= self.config.max_batch_events {
                        self.flush(&mut pending);
                    }
                }
                Some(Err(err)) => {
                    warn!(
                        target: "relay::storage",
                        storage = %self.storage_id,
                        error = %err,
                        "filesystem watcher reported an error"
                    );
                }
                None => {
                    self.flush(&mut pending);
                    break;
                }
            }
        }
    }

    fn flush(&self, pending: &mut HashMap<ItemId, StorageEventKind>) {
        for (name, kind) in pending.drain() {
            let _ = self.events.send(StorageEvent {
                kind,
                storage_id: self.storage_id.clone(),
                name,
            });
        }
    }

    async fn classify(&self, event: Event) -> Vec<(ItemId, StorageEventKind)> {
        let kind = match event.kind {
            EventKind::Create(_) => StorageEventKind::Add,
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => StorageEventKind::Delete,
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => StorageEventKind::Add,
            EventKind::Modify(_) => StorageEventKind::Change,
            EventKind::Remove(_) => StorageEventKind::Delete,
            _ => return Vec::new(),
        };

        let mut out = Vec::new();
        for path in event.paths {
            let Some(name) = self.name_for(&path) else {
                continue;
            };
            if matches!(kind, StorageEventKind::Add | StorageEventKind::Change) {
                // Directories never become tracked items.
                match fs::metadata(&path).await {
                    Ok(md) if md.is_file() => {}
                    _ => continue,
                }
            }
            out.push((name, kind));
        }
        out
    }

    fn path_for(&self, name: &ItemId) -> Result<PathBuf> {
        let rel = Path::new(name.as_str());
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(RelayError::Storage(format!(
                "invalid storage-relative name {name}"
            )));
        }
        Ok(self.root.join(rel))
    }

    fn name_for(&self, path: &Path) -> Option<ItemId> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(os) => parts.push(os.to_string_lossy().into_owned()),
                _ => return None,
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(ItemId::new(parts.join("/")))
        }
    }

    fn file_handle(&self, name: ItemId, path: PathBuf) -> StorageFile {
        StorageFile {
            name,
            storage_id: self.storage_id.clone(),
            kind: StorageKind::LocalFolder,
            local_path: Some(path),
        }
    }
}

fn merge_kinds(existing: StorageEventKind, new: StorageEventKind) -> StorageEventKind {
    match (existing, new) {
        // A change observed while an add is pending is still an add.
        (StorageEventKind::Add, StorageEventKind::Change) => StorageEventKind::Add,
        // Delete followed by add within one window is a replacement.
        (StorageEventKind::Delete, StorageEventKind::Add) => StorageEventKind::Change,
        (_, new) => new,
    }
}

fn to_datetime(time: std::io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    time.ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl StorageHandler for LocalStorageHandler {
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
        true
    }

    fn supports_direct_copy(&self) -> bool {
        true
    }

    async fn list_all_files(&self) -> Result<Vec<StorageFile>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() {
                    if let Some(name) = self.name_for(&entry.path()) {
                        out.push(self.file_handle(name, entry.path()));
                    }
                }
            }
        }
        Ok(out)
    }

    async fn get_file(&self, name: &ItemId) -> Result<StorageFile> {
        let path = self.path_for(name)?;
        match fs::metadata(&path).await {
            Ok(md) if md.is_file() => Ok(self.file_handle(name.clone(), path)),
            Ok(_) => Err(RelayError::NotFound(format!("{name} is not a file"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RelayError::NotFound(
                format!("{name} on storage {}", self.storage_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_file_properties(&self, file: &StorageFile) -> Result<FileProperties> {
        let path = self.path_for(&file.name)?;
        let md = fs::metadata(&path).await?;
        Ok(FileProperties {
            size: md.len(),
            created_at: to_datetime(md.created()),
            modified_at: to_datetime(md.modified()),
        })
    }

    async fn open_read(&self, file: &StorageFile) -> Result<FileReader> {
        let path = self.path_for(&file.name)?;
        let handle = fs::File::open(&path).await?;
        Ok(Box::new(handle))
    }

    async fn put_file(
        &self,
        name: &ItemId,
        mut reader: FileReader,
        size: u64,
        options: &PutOptions,
    ) -> Result<StorageFile> {
        let dest = self.path_for(name)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut out = fs::File::create(&dest).await?;
        let mut copied: u64 = 0;
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            if options.cancel.is_cancelled() {
                drop(out);
                let _ = fs::remove_file(&dest).await;
                return Err(RelayError::Cancelled(format!("copy of {name} aborted")));
            }
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            copied += n as u64;
            if size > 0 {
                options.report(copied as f64 / size as f64);
            }
        }
        out.flush().await?;
        options.report(1.0);

        Ok(self.file_handle(name.clone(), dest))
    }

    async fn copy_direct(
        &self,
        source: &StorageFile,
        options: &PutOptions,
    ) -> Result<StorageFile> {
        let src = source.local_path.as_ref().ok_or_else(|| {
            RelayError::Storage(format!("{} exposes no local path", source.name))
        })?;
        if options.cancel.is_cancelled() {
            return Err(RelayError::Cancelled(format!(
                "copy of {} aborted",
                source.name
            )));
        }
        let dest = self.path_for(&source.name)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(src, &dest).await?;
        options.report(1.0);
        Ok(self.file_handle(source.name.clone(), dest))
    }

    async fn delete_file(&self, file: &StorageFile) -> Result<()> {
        let path = self.path_for(&file.name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            // A file that is already gone is the desired end state.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn add_monitored_file(&self, name: &ItemId) {
        self.monitored.lock().await.insert(name.clone());
    }

    async fn remove_monitored_file(&self, name: &ItemId) {
        self.monitored.lock().await.remove(name);
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    async fn usage(&self) -> Result<Option<StorageUsage>> {
        let mut usage = StorageUsage::default();
        for file in self.list_all_files().await? {
            let props = self.get_file_properties(&file).await?;
            usage.total_bytes += props.size;
            usage.file_count += 1;
        }
        Ok(Some(usage))
    }
}

impl fmt::Debug for LocalStorageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStorageHandler")
            .field("storage_id", &self.storage_id)
            .field("root", &self.root)
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}
