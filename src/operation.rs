//! Operation model — the unit of durability
//!
//! An `Operation` is an immutable mutation intent targeting an attribute
//! path under a container: assign a scalar, append a series point, edit a
//! tag set, delete an attribute, or reference an uploaded file. Operations
//! are serialized with bincode when written to the durable queue and must
//! round-trip exactly; the queue frame layer adds sequence numbers and
//! checksums on top.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Path segment separator in the textual form
const PATH_SEPARATOR: char = '/';

/// Ordered path of an attribute under a container, e.g. `metrics/loss`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributePath(Vec<String>);

impl AttributePath {
    /// Build a path from pre-split segments. Empty segments are dropped.
    pub fn new(segments: Vec<String>) -> Self {
        AttributePath(segments.into_iter().filter(|s| !s.is_empty()).collect())
    }

    /// Parse a `a/b/c` style path
    pub fn parse(path: &str) -> Self {
        AttributePath(
            path.split(PATH_SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl From<&str> for AttributePath {
    fn from(path: &str) -> Self {
        AttributePath::parse(path)
    }
}

/// Scalar value carried by an `Assign` operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
    /// Milliseconds since the Unix epoch
    Timestamp(u64),
}

/// One point appended to a float series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub value: f64,
    /// Wall-clock time of the measurement, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Optional caller-supplied step (e.g. training iteration)
    pub step: Option<f64>,
}

/// Reference to a payload staged in operation storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Storage key under the container's `storage/` directory
    pub key: String,
    /// Name the file had on the caller's side
    pub original_name: String,
}

/// A single durable mutation intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Set a scalar attribute
    Assign { path: AttributePath, value: Value },
    /// Append one point to a float series attribute
    Append { path: AttributePath, point: SeriesPoint },
    /// Add strings to a tag-set attribute
    AddTags { path: AttributePath, tags: Vec<String> },
    /// Remove strings from a tag-set attribute
    RemoveTags { path: AttributePath, tags: Vec<String> },
    /// Delete an attribute and everything under it
    DeleteAttribute { path: AttributePath },
    /// Attach a file whose payload is staged in operation storage
    UploadFile { path: AttributePath, file: FileRef },
}

impl Operation {
    /// Target path of the operation
    pub fn path(&self) -> &AttributePath {
        match self {
            Operation::Assign { path, .. }
            | Operation::Append { path, .. }
            | Operation::AddTags { path, .. }
            | Operation::RemoveTags { path, .. }
            | Operation::DeleteAttribute { path }
            | Operation::UploadFile { path, .. } => path,
        }
    }

    /// Short kind name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Assign { .. } => "assign",
            Operation::Append { .. } => "append",
            Operation::AddTags { .. } => "add_tags",
            Operation::RemoveTags { .. } => "remove_tags",
            Operation::DeleteAttribute { .. } => "delete_attribute",
            Operation::UploadFile { .. } => "upload_file",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_kinds() -> Vec<Operation> {
        vec![
            Operation::Assign {
                path: "params/lr".into(),
                value: Value::Float(0.001),
            },
            Operation::Assign {
                path: "params/epochs".into(),
                value: Value::Int(10),
            },
            Operation::Assign {
                path: "params/shuffle".into(),
                value: Value::Bool(true),
            },
            Operation::Assign {
                path: "sys/name".into(),
                value: Value::String("baseline".to_string()),
            },
            Operation::Assign {
                path: "sys/started".into(),
                value: Value::Timestamp(1_700_000_000_000),
            },
            Operation::Append {
                path: "metrics/loss".into(),
                point: SeriesPoint {
                    value: 0.42,
                    timestamp_ms: 1_700_000_000_123,
                    step: Some(17.0),
                },
            },
            Operation::AddTags {
                path: "sys/tags".into(),
                tags: vec!["baseline".to_string(), "v2".to_string()],
            },
            Operation::RemoveTags {
                path: "sys/tags".into(),
                tags: vec!["draft".to_string()],
            },
            Operation::DeleteAttribute {
                path: "params/obsolete".into(),
            },
            Operation::UploadFile {
                path: "artifacts/model".into(),
                file: FileRef {
                    key: "model-0001.bin".to_string(),
                    original_name: "model.bin".to_string(),
                },
            },
        ]
    }

    #[test]
    fn test_roundtrip_every_kind() {
        for op in all_kinds() {
            let bytes = bincode::serialize(&op).expect("serialize");
            let back: Operation = bincode::deserialize(&bytes).expect("deserialize");
            assert_eq!(back, op, "operation must round-trip unchanged: {:?}", op);
        }
    }

    #[test]
    fn test_path_parse_and_display() {
        let path = AttributePath::parse("metrics/train/loss");
        assert_eq!(path.segments(), ["metrics", "train", "loss"]);
        assert_eq!(path.to_string(), "metrics/train/loss");

        // Repeated and trailing separators collapse
        let messy = AttributePath::parse("//a//b/");
        assert_eq!(messy.segments(), ["a", "b"]);

        assert!(AttributePath::parse("").is_empty());
    }

    #[test]
    fn test_kind_names_are_distinct() {
        let kinds: Vec<&str> = all_kinds().iter().map(|op| op.kind()).collect();
        let mut unique = kinds.clone();
        unique.sort_unstable();
        unique.dedup();
        // Several Assign variants share a kind; only distinct kinds counted
        assert_eq!(unique.len(), 6);
    }
}
