//! Discovery of resumable containers left on disk
//!
//! A sweep over the root directory finds two kinds of leftover work:
//! offline containers awaiting their online resumption, and abandoned
//! online containers whose process died (or closed) before the queue
//! drained. Both are identified purely from on-disk state — the directory
//! name, the metadata record, and the presence of segment files.

use crate::container::{parse_container_dir_name, ContainerId, ContainerType, Mode};
use crate::metadata::read_metadata;
use crate::queue::parse_segment_sequence;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Why a discovered container is resumable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveredState {
    /// Created in offline mode; awaiting an online open
    Offline,
    /// Online-mode container with segment files still on disk — its process
    /// died or closed before draining
    Abandoned,
}

/// One resumable container found under the root
#[derive(Debug, Clone)]
pub struct DiscoveredContainer {
    pub container_id: ContainerId,
    pub container_type: ContainerType,
    pub mode: Mode,
    pub state: DiscoveredState,
    pub dir: PathBuf,
}

/// Explicit view over one root directory of containers.
///
/// Construct it where needed and let it drop; there is no ambient global
/// registry. `container_dir` is the single authority for the
/// `<root>/<type>__<id>` mapping.
#[derive(Debug, Clone)]
pub struct ContainerRegistry {
    root: PathBuf,
}

impl ContainerRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ContainerRegistry { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a container's state lives in
    pub fn container_dir(&self, container_type: ContainerType, id: &ContainerId) -> PathBuf {
        self.root
            .join(crate::container::container_dir_name(container_type, id))
    }

    /// Scan the root for containers that still hold queued work. Unparseable
    /// directory names and malformed metadata are skipped with a warning; a
    /// missing root yields an empty listing.
    pub fn list_resumable(&self) -> io::Result<Vec<DiscoveredContainer>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            let (container_type, container_id) = match parse_container_dir_name(name) {
                Some(identity) => identity,
                None => {
                    debug!(dir = name, "not a container directory; skipping");
                    continue;
                }
            };
            let dir = entry.path();

            let metadata = match read_metadata(&dir) {
                Ok(Some(metadata)) => metadata,
                Ok(None) => {
                    debug!(dir = %dir.display(), "no metadata record; skipping");
                    continue;
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "unreadable metadata; skipping");
                    continue;
                }
            };
            if metadata.container_id != container_id || metadata.container_type != container_type
            {
                warn!(
                    dir = %dir.display(),
                    recorded_id = %metadata.container_id,
                    "metadata disagrees with directory name; skipping"
                );
                continue;
            }

            let state = match metadata.mode {
                Mode::Offline => DiscoveredState::Offline,
                Mode::Online if has_segment_files(&dir)? => DiscoveredState::Abandoned,
                _ => continue,
            };
            found.push(DiscoveredContainer {
                container_id,
                container_type,
                mode: metadata.mode,
                state,
                dir,
            });
        }

        // Directory iteration order is filesystem-dependent
        found.sort_by(|a, b| a.dir.cmp(&b.dir));
        Ok(found)
    }
}

fn has_segment_files(dir: &Path) -> io::Result<bool> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if parse_segment_sequence(name).is_some() {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
