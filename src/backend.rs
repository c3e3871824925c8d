//! Backend boundary — where drained batches leave the process
//!
//! The sync worker submits queue entries through the [`Backend`] trait and
//! learns the highest sequence the remote store accepted. Delivery is
//! at-least-once: after a transient failure the same batch is resubmitted,
//! so real backends are expected to be idempotent by sequence number.
//!
//! Two implementations ship with the crate: [`InMemoryBackend`], the
//! assertion surface for tests, and [`SimulatedBackend`], a fault-injecting
//! wrapper for deterministic simulation runs.

use crate::container::{ContainerId, ContainerType};
use crate::operation::Operation;
use crate::queue::QueueEntry;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Error type for backend submissions
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Temporary failure (network, throttling); the batch should be retried
    Transient(String),
    /// The entry at `sequence` was refused; entries before it in the batch
    /// were accepted
    Rejected { sequence: u64, reason: String },
    /// The container no longer exists remotely; retrying cannot help
    ContainerNotFound(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Transient(msg) => write!(f, "transient backend failure: {}", msg),
            BackendError::Rejected { sequence, reason } => {
                write!(f, "operation {} rejected: {}", sequence, reason)
            }
            BackendError::ContainerNotFound(msg) => write!(f, "container not found: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

/// Destination for drained operation batches.
///
/// `submit` returns the highest sequence number the backend accepted.
/// Batches arrive in strict sequence order per container; a successful
/// return acknowledges a prefix of the batch, never a subset with holes.
pub trait Backend: Send + Sync {
    fn submit<'a>(
        &'a self,
        container_id: &'a ContainerId,
        container_type: ContainerType,
        batch: &'a [QueueEntry],
    ) -> Pin<Box<dyn Future<Output = Result<u64, BackendError>> + Send + 'a>>;
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Default)]
struct InMemoryState {
    accepted: HashMap<(ContainerType, ContainerId), Vec<(u64, Operation)>>,
    submits: u64,
    /// One-shot scripted rejection: (sequence, reason)
    reject_next: Option<(u64, String)>,
    gone: HashSet<ContainerId>,
}

/// Backend that records accepted operations per container, in order.
///
/// Idempotent by sequence number like the real store: resubmitting an
/// already-accepted sequence changes nothing, which is exactly what tests
/// assert after retries.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<InMemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        InMemoryBackend::default()
    }

    /// Snapshot of accepted (sequence, operation) pairs for a container
    pub fn accepted(
        &self,
        container_type: ContainerType,
        container_id: &ContainerId,
    ) -> Vec<(u64, Operation)> {
        self.state
            .lock()
            .accepted
            .get(&(container_type, container_id.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of submit calls observed
    pub fn submit_count(&self) -> u64 {
        self.state.lock().submits
    }

    /// Script the next submit containing `sequence` to reject it. Entries
    /// before it in that batch are still accepted. One-shot.
    pub fn reject_sequence(&self, sequence: u64, reason: impl Into<String>) {
        self.state.lock().reject_next = Some((sequence, reason.into()));
    }

    /// Make all future submits for `container_id` fail with
    /// `ContainerNotFound`, as if the container were deleted remotely
    pub fn remove_container(&self, container_id: &ContainerId) {
        self.state.lock().gone.insert(container_id.clone());
    }
}

impl Backend for InMemoryBackend {
    fn submit<'a>(
        &'a self,
        container_id: &'a ContainerId,
        container_type: ContainerType,
        batch: &'a [QueueEntry],
    ) -> Pin<Box<dyn Future<Output = Result<u64, BackendError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.submits += 1;

            if state.gone.contains(container_id) {
                return Err(BackendError::ContainerNotFound(container_id.to_string()));
            }

            let scripted = match &state.reject_next {
                Some((seq, _)) if batch.iter().any(|e| e.sequence == *seq) => {
                    state.reject_next.take()
                }
                _ => None,
            };

            let key = (container_type, container_id.clone());
            let list = state.accepted.entry(key).or_default();
            let mut last_recorded = list.last().map(|(seq, _)| *seq).unwrap_or(0);

            if let Some((reject_seq, reason)) = scripted {
                for entry in batch.iter().take_while(|e| e.sequence < reject_seq) {
                    if entry.sequence > last_recorded {
                        list.push((entry.sequence, entry.operation.clone()));
                        last_recorded = entry.sequence;
                    }
                }
                return Err(BackendError::Rejected {
                    sequence: reject_seq,
                    reason,
                });
            }

            let mut highest = last_recorded;
            for entry in batch {
                if entry.sequence > last_recorded {
                    list.push((entry.sequence, entry.operation.clone()));
                    last_recorded = entry.sequence;
                }
                highest = highest.max(entry.sequence);
            }
            Ok(highest)
        })
    }
}

// ============================================================================
// Simulated backend with fault injection
// ============================================================================

/// Configuration for simulated fault injection
#[derive(Debug, Clone)]
pub struct SimulatedBackendConfig {
    /// Probability of a submit failing with a transient error
    pub submit_fail_prob: f64,
    /// Simulated latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        SimulatedBackendConfig {
            submit_fail_prob: 0.2,          // 20%
            latency_range_us: (50, 2_000),  // 0.05ms - 2ms
        }
    }
}

impl SimulatedBackendConfig {
    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedBackendConfig {
            submit_fail_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }

    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedBackendConfig {
            submit_fail_prob: 0.5,
            latency_range_us: (500, 10_000),
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackendStats {
    pub submit_attempts: u64,
    pub injected_failures: u64,
    pub delivered: u64,
}

struct SimulatedState {
    rng: ChaCha8Rng,
    stats: SimulatedBackendStats,
}

/// Backend wrapper that injects seeded, reproducible transient faults.
///
/// Fault decisions come from a `ChaCha8Rng`: the same seed and call pattern
/// produce the same failures, so a failing run is replayable.
pub struct SimulatedBackend {
    inner: Arc<dyn Backend>,
    config: SimulatedBackendConfig,
    state: Mutex<SimulatedState>,
}

impl SimulatedBackend {
    pub fn new(inner: Arc<dyn Backend>, seed: u64, config: SimulatedBackendConfig) -> Self {
        SimulatedBackend {
            inner,
            config,
            state: Mutex::new(SimulatedState {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedBackendStats::default(),
            }),
        }
    }

    /// Pass every submit straight through
    pub fn no_faults(inner: Arc<dyn Backend>) -> Self {
        SimulatedBackend::new(inner, 0, SimulatedBackendConfig::no_faults())
    }

    /// Default fault rate with the given seed
    pub fn flaky(inner: Arc<dyn Backend>, seed: u64) -> Self {
        SimulatedBackend::new(inner, seed, SimulatedBackendConfig::default())
    }

    /// Get current statistics
    pub fn stats(&self) -> SimulatedBackendStats {
        self.state.lock().stats.clone()
    }
}

impl Backend for SimulatedBackend {
    fn submit<'a>(
        &'a self,
        container_id: &'a ContainerId,
        container_type: ContainerType,
        batch: &'a [QueueEntry],
    ) -> Pin<Box<dyn Future<Output = Result<u64, BackendError>> + Send + 'a>> {
        // Roll the dice before the await point; the lock is never held
        // across it.
        let (delay_us, inject) = {
            let mut state = self.state.lock();
            state.stats.submit_attempts += 1;
            let (min_us, max_us) = self.config.latency_range_us;
            let delay = if max_us > min_us {
                state.rng.gen_range(min_us..=max_us)
            } else {
                min_us
            };
            let inject = state.rng.gen::<f64>() < self.config.submit_fail_prob;
            if inject {
                state.stats.injected_failures += 1;
            } else {
                state.stats.delivered += 1;
            }
            (delay, inject)
        };

        Box::pin(async move {
            if delay_us > 0 {
                tokio::time::sleep(Duration::from_micros(delay_us)).await;
            }
            if inject {
                return Err(BackendError::Transient(
                    "injected transient failure".to_string(),
                ));
            }
            self.inner.submit(container_id, container_type, batch).await
        })
    }
}
