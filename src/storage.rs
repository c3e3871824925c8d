//! Operation storage — per-container staging area for blob payloads
//!
//! Operations that reference external payloads (file uploads) stage them
//! here: a `storage/` subdirectory of the container directory, keyed by the
//! `FileRef` the queued operation carries. The directory's lifetime is tied
//! to the queue: it is removed only once every referencing entry has been
//! acknowledged, so a crash between enqueue and sync never loses an upload.

use crate::operation::FileRef;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Subdirectory name inside a container directory
pub const STORAGE_DIR_NAME: &str = "storage";

/// Staging area for operation payloads
#[derive(Debug, Clone)]
pub struct OperationStorage {
    dir: PathBuf,
}

impl OperationStorage {
    /// Open (creating if needed) the storage directory for a container
    pub fn open(container_dir: &Path) -> io::Result<Self> {
        let dir = container_dir.join(STORAGE_DIR_NAME);
        fs::create_dir_all(&dir)?;
        Ok(OperationStorage { dir })
    }

    /// The storage directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stage a payload under a unique key derived from the name.
    /// Returns the `FileRef` a queued `UploadFile` operation should carry.
    pub fn store(&self, original_name: &str, contents: &[u8]) -> io::Result<FileRef> {
        let key = self.unique_key(original_name);
        let path = self.dir.join(&key);
        fs::write(&path, contents)?;
        debug!(key = %key, bytes = contents.len(), "payload staged");
        Ok(FileRef {
            key,
            original_name: original_name.to_string(),
        })
    }

    /// Read a staged payload back
    pub fn read(&self, file: &FileRef) -> io::Result<Vec<u8>> {
        fs::read(self.dir.join(&file.key))
    }

    /// Whether a staged payload is still present
    pub fn contains(&self, file: &FileRef) -> bool {
        self.dir.join(&file.key).exists()
    }

    /// Remove the storage directory, but only when the caller reports the
    /// owning queue fully drained — a pending upload must keep its payload.
    /// Returns whether anything was removed.
    pub fn cleanup_if_empty(&self, queue_drained: bool) -> io::Result<bool> {
        if !queue_drained {
            return Ok(false);
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Key layout: `{stem}-{nanos}{.ext}` — unique per store call, keeps the
    /// extension so payloads stay recognizable on disk.
    fn unique_key(&self, original_name: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let name = Path::new(original_name);
        let stem = name
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("payload");
        match name.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}-{}.{}", stem, nanos, ext),
            None => format!("{}-{}", stem, nanos),
        }
    }
}
