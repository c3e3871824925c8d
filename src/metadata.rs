//! Container metadata file — a small write-once record per container
//!
//! `metadata.json` describes the container a directory belongs to: identity,
//! mode, and creation time. It is written exactly once per container
//! lifetime, read back on resume, and consulted by the discovery sweep to
//! classify offline and abandoned queues. Replacement is atomic
//! (temp file + rename) so a crash mid-write never leaves a torn record.

use crate::container::{ContainerId, ContainerType, Mode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Error as IoError, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the metadata record inside a container directory
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Error type for metadata file operations
#[derive(Debug)]
pub enum MetadataError {
    /// I/O error
    Io(IoError),
    /// A record is already present and overwrite was not requested
    AlreadyExists(PathBuf),
    /// The file exists but does not parse
    Malformed(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(e) => write!(f, "metadata I/O error: {}", e),
            MetadataError::AlreadyExists(path) => {
                write!(f, "metadata already written: {}", path.display())
            }
            MetadataError::Malformed(msg) => write!(f, "malformed metadata: {}", msg),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<IoError> for MetadataError {
    fn from(e: IoError) -> Self {
        MetadataError::Io(e)
    }
}

impl From<serde_json::Error> for MetadataError {
    fn from(e: serde_json::Error) -> Self {
        MetadataError::Malformed(e.to_string())
    }
}

/// The persisted container record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetadata {
    pub container_id: ContainerId,
    pub container_type: ContainerType,
    pub mode: Mode,
    /// Creation time, milliseconds since the Unix epoch
    pub created_at_ms: u64,
}

impl ContainerMetadata {
    pub fn new(
        container_id: ContainerId,
        container_type: ContainerType,
        mode: Mode,
        created_at_ms: u64,
    ) -> Self {
        ContainerMetadata {
            container_id,
            container_type,
            mode,
            created_at_ms,
        }
    }
}

/// Handle on a container's metadata record
#[derive(Debug)]
pub struct MetadataFile {
    path: PathBuf,
    record: Option<ContainerMetadata>,
}

impl MetadataFile {
    /// Open the metadata file in a container directory, reading the record
    /// if one is present. A malformed record is an error, not a silent miss.
    pub fn open(container_dir: &Path) -> Result<Self, MetadataError> {
        let path = container_dir.join(METADATA_FILE_NAME);
        let record = match fs::read(&path) {
            Ok(bytes) => Some(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(MetadataFile { path, record })
    }

    /// Persist the record. Fails with `AlreadyExists` if a record is already
    /// present and `overwrite` is false. The write is atomic: a temp file is
    /// written, fsynced, then renamed over the final path.
    pub fn write(
        &mut self,
        record: ContainerMetadata,
        overwrite: bool,
    ) -> Result<(), MetadataError> {
        if self.record.is_some() && !overwrite {
            return Err(MetadataError::AlreadyExists(self.path.clone()));
        }

        let bytes = serde_json::to_vec_pretty(&record)?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), "metadata record written");
        self.record = Some(record);
        Ok(())
    }

    /// The record, if one has been written or read
    pub fn read(&self) -> Option<&ContainerMetadata> {
        self.record.as_ref()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the handle. Nothing is held open between writes, so this is
    /// lifecycle symmetry only; the record stays on disk.
    pub fn close(&mut self) {}

    /// Delete the backing file. Only the processor calls this, and only
    /// after the owning queue has fully drained.
    pub fn cleanup(&mut self) -> Result<(), MetadataError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.record = None;
        Ok(())
    }
}

/// Read just the record from a container directory, without constructing a
/// handle. Used by the discovery sweep.
pub fn read_metadata(container_dir: &Path) -> Result<Option<ContainerMetadata>, MetadataError> {
    let path = container_dir.join(METADATA_FILE_NAME);
    match fs::read(&path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
