//! Background sync worker — drains the durable queue into a backend
//!
//! One worker task per online container. The loop runs one bounded batch per
//! iteration: read from the ack mark forward, submit, ack what was accepted.
//! Because `get_batch` always re-reads from disk, the worker itself is
//! stateless across attempts — a retry after a transient failure submits
//! exactly what the queue still holds, in sequence order.
//!
//! ```text
//! caller ──Flush/Stop──► SyncWorker ──get_batch/ack──► DiskQueue
//!                            │
//!                            ├──submit──► Backend
//!                            ├──watch───► ack mark (wait() observes this)
//!                            └──broadcast► SyncEvent
//! ```

use crate::backend::{Backend, BackendError};
use crate::config::SyncConfig;
use crate::container::{ContainerId, ContainerType};
use crate::queue::{DiskQueue, QueueError};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Commands for the sync worker
pub enum SyncCommand {
    /// Run a drain pass now instead of waiting for the next tick
    Flush,
    /// Finish in-flight work and halt. With a grace period the worker keeps
    /// draining (including transient retries) until drained or the deadline
    /// passes. Replies with whether the queue ended drained.
    Stop {
        grace: Option<Duration>,
        done: oneshot::Sender<bool>,
    },
}

/// Progress and failure notifications published by the worker
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The ack mark advanced to `acked`
    Synced { acked: u64 },
    /// A transient failure scheduled a retry
    RetryScheduled { attempt: u32, delay: Duration },
    /// The backend refused the entry at `sequence`; it will be skipped
    OperationRejected { sequence: u64, reason: String },
    /// The container no longer exists remotely; the worker halted
    ContainerGone,
    /// The worker exited
    Stopped { drained: bool },
}

/// Capped exponential backoff with up to 25% jitter
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            attempt: 0,
        }
    }

    /// Next delay: `base * 2^n` capped at `max`, plus jitter. Returns the
    /// attempt number (starting at 1) alongside it.
    pub fn next(&mut self) -> (u32, Duration) {
        self.attempt = self.attempt.saturating_add(1);
        let exp = (self.attempt - 1).min(16);
        let raw = self
            .base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max);
        let jitter_cap = (raw / 4).as_micros() as u64;
        let jitter_us = if jitter_cap > 0 {
            rand::thread_rng().gen_range(0..=jitter_cap)
        } else {
            0
        };
        (self.attempt, raw + Duration::from_micros(jitter_us))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Outcome of one drain pass
enum PassOutcome {
    /// Acked something; keep draining immediately
    Progress,
    /// Queue empty; sleep until the next interval tick
    Idle,
    /// Retry after the given delay
    Backoff(Duration),
    /// Unrecoverable; the worker must halt
    Halt,
}

struct StopState {
    deadline: Instant,
    done: oneshot::Sender<bool>,
}

/// The worker task state. Constructed and spawned via [`spawn_sync_worker`].
pub struct SyncWorker {
    container_id: ContainerId,
    container_type: ContainerType,
    queue: Arc<Mutex<DiskQueue>>,
    backend: Arc<dyn Backend>,
    config: SyncConfig,
    rx: mpsc::UnboundedReceiver<SyncCommand>,
    ack_tx: watch::Sender<u64>,
    events: broadcast::Sender<SyncEvent>,
    backoff: Backoff,
}

impl SyncWorker {
    /// Run the worker loop until stopped or halted
    pub async fn run(mut self) {
        info!(
            container = %self.container_id,
            container_type = %self.container_type,
            "sync worker started"
        );
        let mut next_attempt = Instant::now() + self.config.sync_interval;
        let mut stop: Option<StopState> = None;

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(SyncCommand::Flush) => {
                        next_attempt = Instant::now();
                    }
                    Some(SyncCommand::Stop { grace: None, done }) => {
                        let drained = self.queue.lock().is_drained();
                        let _ = done.send(drained);
                        self.finish(drained);
                        return;
                    }
                    Some(SyncCommand::Stop { grace: Some(grace), done }) => {
                        stop = Some(StopState {
                            deadline: Instant::now() + grace,
                            done,
                        });
                        next_attempt = Instant::now();
                    }
                    None => {
                        // Every handle dropped; nothing can command us again
                        let drained = self.queue.lock().is_drained();
                        self.finish(drained);
                        return;
                    }
                },
                _ = tokio::time::sleep_until(next_attempt) => {
                    next_attempt = match self.drain_once().await {
                        PassOutcome::Progress => Instant::now(),
                        PassOutcome::Idle => Instant::now() + self.config.sync_interval,
                        PassOutcome::Backoff(delay) => Instant::now() + delay,
                        PassOutcome::Halt => {
                            if let Some(state) = stop.take() {
                                let _ = state.done.send(false);
                            }
                            self.finish(false);
                            return;
                        }
                    };
                }
            }

            if let Some(state) = stop.take() {
                let drained = self.queue.lock().is_drained();
                if drained || Instant::now() >= state.deadline {
                    let _ = state.done.send(drained);
                    self.finish(drained);
                    return;
                }
                // Never sleep past the stop deadline
                if state.deadline < next_attempt {
                    next_attempt = state.deadline;
                }
                stop = Some(state);
            }
        }
    }

    /// One drain pass: read a bounded batch, submit it, ack what the backend
    /// accepted. The queue lock is never held across the submit await.
    async fn drain_once(&mut self) -> PassOutcome {
        let batch = {
            let mut queue = self.queue.lock();
            match queue.get_batch(self.config.batch_max_entries, self.config.batch_max_bytes) {
                Ok(batch) => batch,
                Err(QueueError::Empty) => {
                    self.backoff.reset();
                    return PassOutcome::Idle;
                }
                Err(e) => {
                    let (attempt, delay) = self.backoff.next();
                    warn!(
                        container = %self.container_id,
                        attempt,
                        error = %e,
                        "queue read failed; retrying"
                    );
                    return PassOutcome::Backoff(delay);
                }
            }
        };
        let last_seq = match batch.last() {
            Some(entry) => entry.sequence,
            None => return PassOutcome::Idle,
        };
        debug!(
            container = %self.container_id,
            entries = batch.len(),
            first = batch[0].sequence,
            last = last_seq,
            "submitting batch"
        );

        match self
            .backend
            .submit(&self.container_id, self.container_type, &batch)
            .await
        {
            Ok(highest_accepted) => self.record_ack(highest_accepted.min(last_seq)),
            Err(BackendError::Transient(msg)) => {
                let (attempt, delay) = self.backoff.next();
                warn!(
                    container = %self.container_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %msg,
                    "transient sync failure; retry scheduled"
                );
                let _ = self.events.send(SyncEvent::RetryScheduled { attempt, delay });
                PassOutcome::Backoff(delay)
            }
            Err(BackendError::Rejected { sequence, reason }) => {
                // Report first; only then skip past the offender. Entries
                // before `sequence` in the batch were accepted.
                warn!(
                    container = %self.container_id,
                    sequence,
                    reason = %reason,
                    "operation rejected by backend; skipping"
                );
                let _ = self
                    .events
                    .send(SyncEvent::OperationRejected { sequence, reason });
                self.record_ack(sequence)
            }
            Err(BackendError::ContainerNotFound(msg)) => {
                error!(
                    container = %self.container_id,
                    error = %msg,
                    "container missing remotely; sync halted, entries remain on disk"
                );
                let _ = self.events.send(SyncEvent::ContainerGone);
                PassOutcome::Halt
            }
        }
    }

    /// Advance the ack mark to `sequence` and publish it
    fn record_ack(&mut self, sequence: u64) -> PassOutcome {
        let (before, after) = {
            let mut queue = self.queue.lock();
            let before = queue.ack_mark();
            if let Err(e) = queue.ack(sequence) {
                let (attempt, delay) = self.backoff.next();
                warn!(
                    container = %self.container_id,
                    sequence,
                    attempt,
                    error = %e,
                    "ack failed; retrying"
                );
                return PassOutcome::Backoff(delay);
            }
            (before, queue.ack_mark())
        };

        if after <= before {
            // The backend reported no new progress; backing off avoids a
            // hot resubmit loop against a stuck endpoint.
            let (attempt, delay) = self.backoff.next();
            warn!(
                container = %self.container_id,
                ack_mark = after,
                attempt,
                "backend accepted nothing new; retry scheduled"
            );
            return PassOutcome::Backoff(delay);
        }

        self.ack_tx.send_replace(after);
        let _ = self.events.send(SyncEvent::Synced { acked: after });
        self.backoff.reset();
        PassOutcome::Progress
    }

    fn finish(&self, drained: bool) {
        let _ = self.events.send(SyncEvent::Stopped { drained });
        info!(container = %self.container_id, drained, "sync worker stopped");
        // Dropping self drops the watch sender, waking any blocked wait()
    }
}

// ============================================================================
// SyncHandle - owner-side interface to a running worker
// ============================================================================

/// Handle to a spawned sync worker, owned by the online processor
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncCommand>,
    ack_rx: watch::Receiver<u64>,
    task: tokio::task::JoinHandle<()>,
}

impl SyncHandle {
    /// Nudge the worker to drain now instead of waiting for its tick
    pub fn flush(&self) {
        let _ = self.tx.send(SyncCommand::Flush);
    }

    /// Watch receiver over the published ack mark
    pub fn ack_receiver(&self) -> watch::Receiver<u64> {
        self.ack_rx.clone()
    }

    /// Stop the worker and wait for it to exit. Returns whether the queue
    /// ended drained.
    pub async fn stop(self, grace: Option<Duration>) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(SyncCommand::Stop {
                grace,
                done: done_tx,
            })
            .is_err()
        {
            // Worker already halted on its own (container gone)
            let _ = self.task.await;
            return false;
        }
        let drained = done_rx.await.unwrap_or(false);
        let _ = self.task.await;
        drained
    }
}

/// Spawn a sync worker for one container and return its handle
pub fn spawn_sync_worker(
    container_id: ContainerId,
    container_type: ContainerType,
    queue: Arc<Mutex<DiskQueue>>,
    backend: Arc<dyn Backend>,
    config: SyncConfig,
    events: broadcast::Sender<SyncEvent>,
) -> SyncHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let initial_ack = queue.lock().ack_mark();
    let (ack_tx, ack_rx) = watch::channel(initial_ack);
    let backoff = Backoff::new(config.backoff_base, config.backoff_max);

    let worker = SyncWorker {
        container_id,
        container_type,
        queue,
        backend,
        config,
        rx,
        ack_tx,
        events,
        backoff,
    };
    let task = tokio::spawn(worker.run());

    SyncHandle { tx, ack_rx, task }
}
