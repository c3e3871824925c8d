//! Container identity and tracking modes
//!
//! A container is the logical entity (an experiment run, a project, or a
//! model) that owns a stream of metadata operations. Its identity — the
//! `(ContainerId, ContainerType)` pair — namespaces all on-disk state so
//! concurrent containers never collide.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between the container type and id in directory names
const DIR_SEPARATOR: &str = "__";

/// Unique identifier of a container, assigned by the caller
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        ContainerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        ContainerId(id.to_string())
    }
}

impl From<String> for ContainerId {
    fn from(id: String) -> Self {
        ContainerId(id)
    }
}

/// Kind of entity the container represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    /// A single experiment run
    Run,
    /// A project grouping many runs
    Project,
    /// A registered model
    Model,
}

impl ContainerType {
    /// Directory-name component for this container type
    pub fn dir_name(&self) -> &'static str {
        match self {
            ContainerType::Run => "run",
            ContainerType::Project => "project",
            ContainerType::Model => "model",
        }
    }

    /// Parse a directory-name component back to a ContainerType
    pub fn from_dir_name(name: &str) -> Option<ContainerType> {
        match name {
            "run" => Some(ContainerType::Run),
            "project" => Some(ContainerType::Project),
            "model" => Some(ContainerType::Model),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Tracking mode recorded in a container's metadata file.
///
/// Only `Online` and `Offline` containers instantiate the operation
/// processor; `Debug` and `ReadOnly` are recorded by the higher-level API
/// and matter here only when classifying directories during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Operations are drained to the backend by a live sync worker
    Online,
    /// Operations accumulate on disk for later resumption
    Offline,
    /// Nothing is transmitted; used for local experimentation
    Debug,
    /// The container is opened for reading only
    ReadOnly,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Online => "online",
            Mode::Offline => "offline",
            Mode::Debug => "debug",
            Mode::ReadOnly => "read_only",
        };
        f.write_str(name)
    }
}

/// Directory name for a container: `{type}__{id}`
pub fn container_dir_name(container_type: ContainerType, id: &ContainerId) -> String {
    format!("{}{}{}", container_type.dir_name(), DIR_SEPARATOR, id)
}

/// Parse a container directory name back to its identity
pub fn parse_container_dir_name(name: &str) -> Option<(ContainerType, ContainerId)> {
    let (type_part, id_part) = name.split_once(DIR_SEPARATOR)?;
    let container_type = ContainerType::from_dir_name(type_part)?;
    if id_part.is_empty() {
        return None;
    }
    Some((container_type, ContainerId::new(id_part)))
}
