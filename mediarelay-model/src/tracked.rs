use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, StorageId};

/// Durable ground truth for "where is this file".
///
/// A record exists only while the generators believe the file exists on
/// `source_storage_id`. `target_storage_ids` is a best-effort cache of
/// successful copy destinations, not a guarantee.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedMediaItem {
    pub id: ItemId,
    /// Link to an externally expected item, when the control plane announced
    /// the file ahead of its arrival.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_media_id: Option<String>,
    pub source_storage_id: StorageId,
    pub target_storage_ids: Vec<StorageId>,
    pub last_seen: DateTime<Utc>,
    /// Grace period in milliseconds after which a non-refreshed record is
    /// considered stale and purged.
    pub linger_time: i64,
}

impl TrackedMediaItem {
    pub fn new(id: ItemId, source_storage_id: StorageId, linger_time: i64) -> Self {
        Self {
            id,
            expected_media_id: None,
            source_storage_id,
            target_storage_ids: Vec::new(),
            last_seen: Utc::now(),
            linger_time,
        }
    }

    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.last_seen = now;
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now - self.last_seen > Duration::milliseconds(self.linger_time)
    }

    /// Record a destination as holding a copy. Set semantics.
    pub fn add_target(&mut self, storage_id: StorageId) {
        if !self.target_storage_ids.contains(&storage_id) {
            self.target_storage_ids.push(storage_id);
        }
    }

    pub fn remove_target(&mut self, storage_id: &StorageId) {
        self.target_storage_ids.retain(|id| id != storage_id);
    }
}

/// Kind tag for derived records produced by transformation steps.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentKind {
    Scan,
    Metadata,
    Thumbnail,
    Preview,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Scan => "scan",
            AttachmentKind::Metadata => "metadata",
            AttachmentKind::Thumbnail => "thumbnail",
            AttachmentKind::Preview => "preview",
        }
    }
}

/// Derived record attached to a tracked item, keyed by a deterministic id so
/// re-running a transformation overwrites the previous result.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub kind: AttachmentKind,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub created: DateTime<Utc>,
}

impl Attachment {
    pub fn new(
        id: impl Into<String>,
        kind: AttachmentKind,
        content_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            content_type: content_type.into(),
            payload,
            created: Utc::now(),
        }
    }
}
