//! Deterministic interleaving driver.
//!
//! Replays the protocol as a sequence of atomic steps chosen by a seeded
//! RNG: any ingestor, any collector phase, a refresh of any worker, or
//! epoch advancement may run next, which is exactly the scheduling model
//! the protocol is specified against (transactions are atomic; their order
//! is not). Every step is followed by a full invariant check, so a bad
//! schedule pinpoints the step and operation that broke a property.
//!
//! Same seed, same schedule: failures reproduce exactly.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::debug;

use crate::cache::WorkerCache;
use crate::collector::GarbageCollector;
use crate::epoch::{Epoch, SeriesId};
use crate::error::Error;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::invariants::{self, InvariantViolation};
use crate::refresh::CacheRefresher;
use crate::store::{DataReferences, InMemoryBackend};
use crate::telemetry::{CountersSnapshot, ProtocolCounters};

/// Simulation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Ingest workers (one cache each).
    pub workers: usize,
    /// Series ids are drawn from `1..=series_space`.
    pub series_space: SeriesId,
    /// Atomic steps to execute.
    pub steps: usize,
    /// RNG seed; same seed reproduces the same schedule.
    pub seed: u64,
    /// Grace window.
    pub delay: Epoch,
    /// Maximum ingest batch size.
    pub batch_max: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { workers: 3, series_space: 6, steps: 400, seed: 0, delay: 1, batch_max: 3 }
    }
}

/// Why a simulation stopped early.
#[derive(Error, Debug)]
pub enum SimError {
    /// An invariant broke; the step index and operation identify the
    /// schedule position.
    #[error("invariant violated at step {step} after {op}: {violation}")]
    Violation {
        step: usize,
        op: &'static str,
        #[source]
        violation: InvariantViolation,
    },

    /// An ingest failed in a way the protocol does not allow here (with a
    /// live refresher a batch never exhausts its retries).
    #[error("ingest failed at step {step}: {source}")]
    Ingest {
        step: usize,
        #[source]
        source: Error,
    },
}

/// Per-operation schedule counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub ingests: usize,
    pub drops: usize,
    pub marks: usize,
    pub delete_cycles: usize,
    pub refreshes: usize,
    pub advances: usize,
    pub faults_injected: usize,
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct SimReport {
    /// Steps executed.
    pub steps: usize,
    /// Schedule composition.
    pub ops: OpCounts,
    /// Protocol counters at the end of the run.
    pub counters: CountersSnapshot,
}

/// A live simulation: the whole actor fleet over one in-memory backend.
pub struct Simulation {
    backend: Arc<InMemoryBackend>,
    caches: Vec<Arc<WorkerCache>>,
    ingestors: Vec<Ingestor<InMemoryBackend>>,
    collector: GarbageCollector<InMemoryBackend>,
    refresher: Arc<CacheRefresher<InMemoryBackend>>,
    counters: Arc<ProtocolCounters>,
    rng: StdRng,
    config: SimConfig,
    ops: OpCounts,
    steps_run: usize,
}

impl Simulation {
    /// Build the fleet. `config.delay` must be >= 1 and `workers` >= 1.
    #[must_use]
    pub fn new(config: SimConfig) -> Self {
        assert!(config.delay >= 1, "delay must be >= 1");
        assert!(config.workers >= 1, "workers must be >= 1");
        assert!(config.batch_max >= 1, "batch_max must be >= 1");

        let backend = Arc::new(InMemoryBackend::new(1));
        let counters = Arc::new(ProtocolCounters::default());
        let caches: Vec<Arc<WorkerCache>> =
            (0..config.workers).map(|w| Arc::new(WorkerCache::new(w))).collect();
        let refresher = Arc::new(CacheRefresher::new(
            Arc::clone(&backend),
            caches.clone(),
            Arc::clone(&counters),
        ));
        let ingestors = (0..config.workers)
            .map(|w| {
                Ingestor::new(
                    w,
                    Arc::clone(&caches[w]),
                    Arc::clone(&backend),
                    Arc::clone(&refresher),
                    Arc::clone(&counters),
                    8,
                )
            })
            .collect();
        let collector =
            GarbageCollector::new(Arc::clone(&backend), config.delay, Arc::clone(&counters));

        Self {
            backend,
            caches,
            ingestors,
            collector,
            refresher,
            counters,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            ops: OpCounts::default(),
            steps_run: 0,
        }
    }

    /// The shared backend (for end-of-run assertions).
    #[must_use]
    pub fn backend(&self) -> &Arc<InMemoryBackend> {
        &self.backend
    }

    /// The worker caches.
    #[must_use]
    pub fn caches(&self) -> &[Arc<WorkerCache>] {
        &self.caches
    }

    /// Ingest a batch on a specific worker (scenario scripting).
    pub fn ingest(&mut self, worker: usize, batch: &[SeriesId]) -> Result<IngestOutcome, SimError> {
        self.ingestors[worker]
            .ingest(batch)
            .map_err(|source| SimError::Ingest { step: self.steps_run, source })
    }

    /// Check every invariant right now.
    pub fn check(&self, op: &'static str) -> Result<(), SimError> {
        invariants::check(&self.backend.snapshot(), &self.caches).map_err(|violation| {
            SimError::Violation { step: self.steps_run, op, violation }
        })
    }

    fn random_batch(&mut self) -> Vec<SeriesId> {
        let len = self.rng.random_range(1..=self.config.batch_max);
        (0..len).map(|_| self.rng.random_range(1..=self.config.series_space)).collect()
    }

    /// Execute one randomly-chosen atomic step, then check all invariants.
    pub fn step(&mut self) -> Result<(), SimError> {
        self.steps_run += 1;
        let roll = self.rng.random_range(0..100u32);
        let op = match roll {
            0..40 => {
                let worker = self.rng.random_range(0..self.config.workers);
                let batch = self.random_batch();
                self.ingestors[worker]
                    .ingest(&batch)
                    .map_err(|source| SimError::Ingest { step: self.steps_run, source })?;
                self.ops.ingests += 1;
                "ingest"
            }
            40..48 => {
                // A creation abort for a random id; one-shot, consumed by
                // the next resolve of that id.
                let id = self.rng.random_range(1..=self.config.series_space);
                self.backend.inject_create_fault(id);
                self.ops.faults_injected += 1;
                "inject_create_fault"
            }
            48..60 => {
                // Sorted so the per-id coin flips consume the RNG in a
                // stable order; set iteration order varies run to run.
                let mut referenced: Vec<SeriesId> =
                    self.backend.referenced_snapshot().into_iter().collect();
                referenced.sort_unstable();
                let expired: Vec<SeriesId> = referenced
                    .into_iter()
                    .filter(|_| self.rng.random_bool(0.5))
                    .take(2)
                    .collect();
                self.collector.drop_chunk_data(&expired);
                self.ops.drops += 1;
                "drop_chunk_data"
            }
            60..72 => {
                self.collector.mark_unused();
                self.ops.marks += 1;
                "mark_unused"
            }
            72..84 => {
                self.collector.run_delete_cycle();
                self.ops.delete_cycles += 1;
                "run_delete_cycle"
            }
            84..93 => {
                let worker = self.rng.random_range(0..self.config.workers);
                self.refresher.refresh_worker(&self.caches[worker]);
                self.ops.refreshes += 1;
                "refresh_worker"
            }
            _ => {
                let by = self.rng.random_range(0..=2u64);
                self.collector.advance_now(by);
                self.ops.advances += 1;
                "advance_now"
            }
        };
        self.check(op)
    }

    /// Run the configured number of steps.
    pub fn run(&mut self) -> Result<SimReport, SimError> {
        self.check("init")?;
        for _ in 0..self.config.steps {
            self.step()?;
        }
        debug!(ops = ?self.ops, "simulation complete");
        Ok(SimReport {
            steps: self.steps_run,
            ops: self.ops,
            counters: self.counters.snapshot(),
        })
    }
}
