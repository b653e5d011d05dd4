//! Call contract for external media transformation commands.
//!
//! The worker only sees this trait; whether a transformation is a local
//! subprocess or a remote gateway call is an implementation detail of the
//! transformer.

use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use crate::error::Result;
use mediarelay_model::{AttachmentKind, ItemId};

pub mod command;

pub use command::CommandTransformer;

/// Opaque external transformation calls against a resolved file path.
///
/// Implementations own their temp artifacts and must clean them up regardless
/// of outcome.
#[async_trait]
pub trait MediaTransformer: Send + Sync {
    /// Deep probe of the file (streams, durations, formats).
    async fn scan(&self, path: &Path) -> Result<serde_json::Value>;

    /// Basic metadata extraction; also chained after every successful copy.
    async fn metadata(&self, path: &Path) -> Result<serde_json::Value>;

    /// Single representative frame, encoded as an image.
    async fn thumbnail(&self, path: &Path) -> Result<Vec<u8>>;

    /// Low-resolution preview rendition.
    async fn preview(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Deterministic attachment id for a (kind, file) pair, so re-running a
/// transformation overwrites the previous derived record.
pub fn attachment_id(kind: AttachmentKind, file_name: &ItemId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(file_name.as_str().as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}
