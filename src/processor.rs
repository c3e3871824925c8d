//! Operation processor — the per-container lifecycle coordinator
//!
//! One processor owns one container's durable state: the disk queue, the
//! metadata record, and the payload staging area. Callers move it through
//! an explicit lifecycle:
//!
//! ```text
//! Created ──start──► Started ──stop──► Stopping ──close──► Closed
//!                       │                                    ▲
//!                       └──────────────close─────────────────┘
//! ```
//!
//! In online mode `start` also spawns a [`SyncWorker`](crate::sync) that
//! drains the queue against the backend; in offline mode no backend is ever
//! constructed and operations accumulate on disk for a later online open.
//! Both modes share one on-disk format — the queue files are the contract
//! between them.

use crate::backend::Backend;
use crate::config::ProcessorConfig;
use crate::container::{container_dir_name, ContainerId, ContainerType, Mode};
use crate::metadata::{ContainerMetadata, MetadataError, MetadataFile};
use crate::operation::Operation;
use crate::queue::{DiskQueue, QueueError, LOCK_FILE_NAME};
use crate::storage::OperationStorage;
use crate::sync::{spawn_sync_worker, SyncEvent, SyncHandle};
use parking_lot::Mutex;
use std::fs;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Lifecycle states of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, nothing opened yet
    Created,
    /// Disk state open; enqueue accepted; worker running in online mode
    Started,
    /// Worker stopped or stopping; no new operations accepted
    Stopping,
    /// Everything released; terminal
    Closed,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Lifecycle::Created => "created",
            Lifecycle::Started => "started",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Error type for processor operations
#[derive(Debug)]
pub enum ProcessorError {
    /// The operation is invalid in the processor's current lifecycle state
    InactiveContainer(Lifecycle),
    /// Durable queue failure
    Queue(QueueError),
    /// Metadata file failure
    Metadata(MetadataError),
    /// Other I/O failure
    Io(IoError),
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessorError::InactiveContainer(lifecycle) => {
                write!(f, "container is not active (lifecycle: {})", lifecycle)
            }
            ProcessorError::Queue(e) => write!(f, "queue error: {}", e),
            ProcessorError::Metadata(e) => write!(f, "metadata error: {}", e),
            ProcessorError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<QueueError> for ProcessorError {
    fn from(e: QueueError) -> Self {
        ProcessorError::Queue(e)
    }
}

impl From<MetadataError> for ProcessorError {
    fn from(e: MetadataError) -> Self {
        ProcessorError::Metadata(e)
    }
}

impl From<IoError> for ProcessorError {
    fn from(e: IoError) -> Self {
        ProcessorError::Io(e)
    }
}

/// Snapshot of the queue's water marks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    /// Highest sequence durably appended
    pub appended: u64,
    /// Highest sequence acknowledged by the backend
    pub acked: u64,
}

impl SyncProgress {
    /// Whether everything appended has been acknowledged
    pub fn is_synced(&self) -> bool {
        self.acked == self.appended
    }
}

/// Open per-container resources, present between start and close
struct Active {
    queue: Arc<Mutex<DiskQueue>>,
    metadata: MetadataFile,
    storage: OperationStorage,
    worker: Option<SyncHandle>,
}

struct Inner {
    lifecycle: Lifecycle,
    active: Option<Active>,
}

/// Coordinates a container's durable queue, metadata, storage, and sync
/// worker behind one lifecycle.
///
/// All methods take `&self`; internal state lives behind a mutex that is
/// never held across an await. Blocking methods (`wait`, `stop`, `close`)
/// release it before parking, so the worker can keep making progress.
pub struct OperationProcessor {
    container_id: ContainerId,
    container_type: ContainerType,
    mode: Mode,
    backend: Option<Arc<dyn Backend>>,
    config: ProcessorConfig,
    dir: PathBuf,
    events: broadcast::Sender<SyncEvent>,
    inner: Mutex<Inner>,
}

impl OperationProcessor {
    /// Processor that drains to `backend` via a background sync worker.
    /// `start` must run inside a tokio runtime in this mode.
    pub fn online(
        container_id: ContainerId,
        container_type: ContainerType,
        backend: Arc<dyn Backend>,
        config: ProcessorConfig,
    ) -> Self {
        Self::new(container_id, container_type, Mode::Online, Some(backend), config)
    }

    /// Processor that only accumulates operations on disk; no backend is
    /// ever constructed or invoked
    pub fn offline(
        container_id: ContainerId,
        container_type: ContainerType,
        config: ProcessorConfig,
    ) -> Self {
        Self::new(container_id, container_type, Mode::Offline, None, config)
    }

    fn new(
        container_id: ContainerId,
        container_type: ContainerType,
        mode: Mode,
        backend: Option<Arc<dyn Backend>>,
        config: ProcessorConfig,
    ) -> Self {
        let dir = config.root.join(container_dir_name(container_type, &container_id));
        let (events, _) = broadcast::channel(1024);
        OperationProcessor {
            container_id,
            container_type,
            mode,
            backend,
            config,
            dir,
            events,
            inner: Mutex::new(Inner {
                lifecycle: Lifecycle::Created,
                active: None,
            }),
        }
    }

    /// Open the container's disk state and, in online mode, spawn the sync
    /// worker. Recovery runs here: an existing directory is resumed with its
    /// queue content and original metadata record intact.
    ///
    /// Idempotent while `Started`; fails with `InactiveContainer` once the
    /// processor has moved past it.
    pub fn start(&self) -> Result<(), ProcessorError> {
        let mut inner = self.inner.lock();
        match inner.lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Started => return Ok(()),
            other => return Err(ProcessorError::InactiveContainer(other)),
        }

        fs::create_dir_all(&self.dir)?;
        let queue = DiskQueue::open(&self.dir, &self.config.queue)?;
        let mut metadata = MetadataFile::open(&self.dir)?;
        if metadata.read().is_none() {
            let record = ContainerMetadata::new(
                self.container_id.clone(),
                self.container_type,
                self.mode,
                now_ms(),
            );
            metadata.write(record, false)?;
        }
        let storage = OperationStorage::open(&self.dir)?;

        let queue = Arc::new(Mutex::new(queue));
        let worker = match (&self.backend, self.mode) {
            (Some(backend), Mode::Online) => Some(spawn_sync_worker(
                self.container_id.clone(),
                self.container_type,
                Arc::clone(&queue),
                Arc::clone(backend),
                self.config.sync.clone(),
                self.events.clone(),
            )),
            _ => None,
        };

        inner.active = Some(Active {
            queue,
            metadata,
            storage,
            worker,
        });
        inner.lifecycle = Lifecycle::Started;
        info!(
            container = %self.container_id,
            container_type = %self.container_type,
            mode = %self.mode,
            dir = %self.dir.display(),
            "operation processor started"
        );
        Ok(())
    }

    /// Durably append a batch of operations; returns the last assigned
    /// sequence number. Never blocks on remote delivery — durability here
    /// means "on local disk", and the worker transmits asynchronously.
    pub fn enqueue(&self, operations: Vec<Operation>) -> Result<u64, ProcessorError> {
        let queue = self.started_queue()?;
        let sequence = queue.lock().append_batch(&operations)?;
        Ok(sequence)
    }

    /// Nudge the sync worker to run a drain pass now instead of waiting for
    /// its next tick. Does not block until completion. No-op in offline mode.
    pub fn flush(&self) -> Result<(), ProcessorError> {
        let inner = self.inner.lock();
        if inner.lifecycle != Lifecycle::Started {
            return Err(ProcessorError::InactiveContainer(inner.lifecycle));
        }
        if let Some(active) = inner.active.as_ref() {
            if let Some(worker) = active.worker.as_ref() {
                worker.flush();
            }
        }
        Ok(())
    }

    /// Block until everything appended so far is acknowledged, or the
    /// timeout elapses; returns whether full synchronization was reached.
    ///
    /// The append mark is observed at call time — operations enqueued after
    /// `wait` begins are not waited for. A zero timeout answers without
    /// blocking. Without a live worker (offline mode, or after stop) the
    /// current truth is returned immediately.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<bool, ProcessorError> {
        let (target, queue, ack_rx) = {
            let inner = self.inner.lock();
            match inner.lifecycle {
                Lifecycle::Started | Lifecycle::Stopping => {}
                other => return Err(ProcessorError::InactiveContainer(other)),
            }
            let active = match inner.active.as_ref() {
                Some(active) => active,
                None => return Err(ProcessorError::InactiveContainer(inner.lifecycle)),
            };
            let queue = Arc::clone(&active.queue);
            let target = queue.lock().append_mark();
            let ack_rx = active.worker.as_ref().map(|w| w.ack_receiver());
            (target, queue, ack_rx)
        };

        if queue.lock().ack_mark() >= target {
            return Ok(true);
        }
        let mut ack_rx = match ack_rx {
            Some(rx) => rx,
            None => return Ok(false),
        };
        if timeout == Some(Duration::ZERO) {
            return Ok(false);
        }

        let reached = async {
            loop {
                let current = *ack_rx.borrow_and_update();
                if current >= target {
                    return true;
                }
                if ack_rx.changed().await.is_err() {
                    // Worker exited; report the final truth
                    return queue.lock().ack_mark() >= target;
                }
            }
        };

        match timeout {
            None => Ok(reached.await),
            Some(limit) => match tokio::time::timeout(limit, reached).await {
                Ok(synced) => Ok(synced),
                Err(_) => Ok(queue.lock().ack_mark() >= target),
            },
        }
    }

    /// Stop the sync worker. With a grace period the worker keeps draining
    /// (including retries) until drained or the deadline passes. Returns
    /// whether the queue ended drained; entries remain durably queued either
    /// way. Outside `Started` this is a no-op reporting the current state.
    pub async fn stop(&self, grace: Option<Duration>) -> Result<bool, ProcessorError> {
        let (worker, queue) = {
            let mut inner = self.inner.lock();
            if inner.lifecycle != Lifecycle::Started {
                let drained = inner
                    .active
                    .as_ref()
                    .map(|a| a.queue.lock().is_drained())
                    .unwrap_or(true);
                return Ok(drained);
            }
            inner.lifecycle = Lifecycle::Stopping;
            let active = match inner.active.as_mut() {
                Some(active) => active,
                None => return Ok(true),
            };
            (active.worker.take(), Arc::clone(&active.queue))
        };

        let drained = match worker {
            Some(worker) => worker.stop(grace).await,
            None => queue.lock().is_drained(),
        };
        info!(
            container = %self.container_id,
            drained,
            "operation processor stopped"
        );
        Ok(drained)
    }

    /// Release everything. The worker is stopped without grace if still
    /// running. A fully drained container has its files and directory
    /// removed; anything undrained is preserved on disk for resumption.
    /// Idempotent.
    pub async fn close(&self) -> Result<(), ProcessorError> {
        let worker = {
            let mut inner = self.inner.lock();
            if inner.lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            if inner.lifecycle == Lifecycle::Started {
                inner.lifecycle = Lifecycle::Stopping;
            }
            inner.active.as_mut().and_then(|a| a.worker.take())
        };
        if let Some(worker) = worker {
            worker.stop(None).await;
        }

        let active = {
            let mut inner = self.inner.lock();
            inner.lifecycle = Lifecycle::Closed;
            inner.active.take()
        };
        let Some(mut active) = active else {
            return Ok(());
        };

        let mut queue = active.queue.lock();
        if queue.is_drained() {
            active.storage.cleanup_if_empty(true)?;
            active.metadata.cleanup()?;
            queue.cleanup_if_empty()?;
            queue.close()?;
            drop(queue);

            match fs::remove_file(self.dir.join(LOCK_FILE_NAME)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if let Err(e) = fs::remove_dir(&self.dir) {
                // Foreign files in the container directory are not ours to
                // delete; leave the directory behind.
                warn!(
                    dir = %self.dir.display(),
                    error = %e,
                    "container directory not removed"
                );
            }
            info!(container = %self.container_id, "container closed and cleaned up");
        } else {
            let pending = queue.pending();
            queue.close()?;
            drop(queue);
            active.metadata.close();
            info!(
                container = %self.container_id,
                pending,
                "container closed; queued entries preserved for resumption"
            );
        }
        Ok(())
    }

    /// Current queue water marks
    pub fn progress(&self) -> Result<SyncProgress, ProcessorError> {
        let inner = self.inner.lock();
        match inner.lifecycle {
            Lifecycle::Started | Lifecycle::Stopping => {}
            other => return Err(ProcessorError::InactiveContainer(other)),
        }
        let active = match inner.active.as_ref() {
            Some(active) => active,
            None => return Err(ProcessorError::InactiveContainer(inner.lifecycle)),
        };
        let queue = active.queue.lock();
        Ok(SyncProgress {
            appended: queue.append_mark(),
            acked: queue.ack_mark(),
        })
    }

    /// Subscribe to sync worker events. Valid in any lifecycle state; an
    /// offline processor simply never publishes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Staging area for upload payloads; valid while `Started`
    pub fn storage(&self) -> Result<OperationStorage, ProcessorError> {
        let inner = self.inner.lock();
        if inner.lifecycle != Lifecycle::Started {
            return Err(ProcessorError::InactiveContainer(inner.lifecycle));
        }
        match inner.active.as_ref() {
            Some(active) => Ok(active.storage.clone()),
            None => Err(ProcessorError::InactiveContainer(inner.lifecycle)),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lock().lifecycle
    }

    pub fn container_id(&self) -> &ContainerId {
        &self.container_id
    }

    pub fn container_type(&self) -> ContainerType {
        self.container_type
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The container directory this processor owns
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn started_queue(&self) -> Result<Arc<Mutex<DiskQueue>>, ProcessorError> {
        let inner = self.inner.lock();
        if inner.lifecycle != Lifecycle::Started {
            return Err(ProcessorError::InactiveContainer(inner.lifecycle));
        }
        match inner.active.as_ref() {
            Some(active) => Ok(Arc::clone(&active.queue)),
            None => Err(ProcessorError::InactiveContainer(inner.lifecycle)),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
