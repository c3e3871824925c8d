//! Durable operation queue and background sync for experiment metadata
//!
//! Callers attach values (scalars, series points, tags, files) to a
//! long-lived container — a run, project, or model — and this crate gets
//! those mutations to a remote store reliably: every operation is written
//! to an append-only disk queue before the call returns, and a background
//! worker drains the queue against the backend with bounded batches,
//! capped exponential backoff, and strict per-container ordering.
//!
//! ## Architecture
//!
//! ```text
//! enqueue → DiskQueue (ops-*.log segments) → SyncWorker → Backend
//!               ↓                                ↓
//!          fsync before return              ack → ack.json
//! ```
//!
//! ## Key Features
//!
//! - **Durable before acknowledged**: a returned sequence survives a crash
//! - **Crash-tolerant recovery**: CRC32-framed entries; corrupted tails are
//!   discarded without losing older or newer segments
//! - **Offline mode**: same disk format with no backend; a later online
//!   open drains everything in original order
//! - **At-least-once delivery**: retries re-read from disk, acks only advance

pub mod backend;
pub mod config;
pub mod container;
pub mod discovery;
pub mod metadata;
pub mod operation;
pub mod processor;
pub mod queue;
pub mod storage;
pub mod sync;

pub use backend::{
    Backend, BackendError, InMemoryBackend, SimulatedBackend, SimulatedBackendConfig,
    SimulatedBackendStats,
};
pub use config::{ProcessorConfig, QueueConfig, SyncConfig};
pub use container::{ContainerId, ContainerType, Mode};
pub use discovery::{ContainerRegistry, DiscoveredContainer, DiscoveredState};
pub use metadata::{ContainerMetadata, MetadataError, MetadataFile};
pub use operation::{AttributePath, FileRef, Operation, SeriesPoint, Value};
pub use processor::{Lifecycle, OperationProcessor, ProcessorError, SyncProgress};
pub use queue::{DiskQueue, QueueEntry, QueueError, QueueLock};
pub use storage::OperationStorage;
pub use sync::{spawn_sync_worker, Backoff, SyncEvent, SyncHandle, SyncWorker};
