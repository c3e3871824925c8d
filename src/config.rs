//! Configuration for the operation processor
//!
//! Defines configuration structs for the durable queue and the background
//! sync worker. All tuning knobs live here; the component contracts
//! (bounded batches, monotonic acks, capped backoff) hold for any values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for an operation processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Root directory under which per-container directories are created
    pub root: PathBuf,
    /// Durable queue settings
    pub queue: QueueConfig,
    /// Background sync settings
    pub sync: SyncConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            root: PathBuf::from(".tracklet"),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl ProcessorConfig {
    /// Configuration rooted at a specific directory
    pub fn at_root(root: impl Into<PathBuf>) -> Self {
        ProcessorConfig {
            root: root.into(),
            ..ProcessorConfig::default()
        }
    }

    /// Configuration for tests (tiny segments, fast ticks).
    /// Tests are expected to override `root` with a temp directory.
    pub fn test() -> Self {
        ProcessorConfig {
            root: std::env::temp_dir().join("tracklet-test"),
            queue: QueueConfig::test(),
            sync: SyncConfig::test(),
        }
    }
}

/// Durable queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Segment size at which the queue rotates to a new file (default: 16MB)
    pub max_segment_bytes: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_segment_bytes: 16 * 1024 * 1024, // 16MB
        }
    }
}

impl QueueConfig {
    /// Configuration for tests (small segments to force rotation)
    pub fn test() -> Self {
        QueueConfig {
            max_segment_bytes: 1024, // 1KB
        }
    }
}

/// Background sync worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Interval between drain passes when the queue is idle (default: 500ms)
    #[serde(with = "duration_millis")]
    pub sync_interval: Duration,
    /// Maximum entries per submitted batch (default: 1,000)
    pub batch_max_entries: usize,
    /// Maximum payload bytes per submitted batch (default: 1MB)
    pub batch_max_bytes: usize,
    /// First retry delay after a transient backend failure (default: 100ms)
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,
    /// Retry delay cap (default: 10s)
    #[serde(with = "duration_millis")]
    pub backoff_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            sync_interval: Duration::from_millis(500),
            batch_max_entries: 1_000,
            batch_max_bytes: 1024 * 1024, // 1MB
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Configuration for tests (fast ticks, small batches, short backoff)
    pub fn test() -> Self {
        SyncConfig {
            sync_interval: Duration::from_millis(10),
            batch_max_entries: 16,
            batch_max_bytes: 16 * 1024, // 16KB
            backoff_base: Duration::from_millis(2),
            backoff_max: Duration::from_millis(50),
        }
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProcessorConfig::default();
        assert_eq!(config.root, PathBuf::from(".tracklet"));
        assert!(config.queue.max_segment_bytes > 0);
        assert!(config.sync.backoff_base <= config.sync.backoff_max);
    }

    #[test]
    fn test_sync_config_serialization() {
        let config = SyncConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.sync_interval, parsed.sync_interval);
        assert_eq!(config.batch_max_entries, parsed.batch_max_entries);
        assert_eq!(config.backoff_max, parsed.backoff_max);
    }

    #[test]
    fn test_at_root() {
        let config = ProcessorConfig::at_root("/tmp/track-root");
        assert_eq!(config.root, PathBuf::from("/tmp/track-root"));
    }
}
