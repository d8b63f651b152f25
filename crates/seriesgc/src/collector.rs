//! Garbage collector actor.
//!
//! Cycles through phases that expire stale data references, mark unused
//! metadata, and delete or resurrect marked-and-expired rows. Phases may be
//! entered in any order and interleave freely with ingestion and cache
//! refresh; multiple collector instances share a phase lock so no two of
//! them execute a phase concurrently.
//!
//! The grace window (`delay`) is the protocol's load-bearing constant: a
//! row must stay marked for at least `delay` epochs before it becomes
//! delete-eligible, which bounds how stale a cache's view may get before it
//! risks referencing deleted metadata and gives the refresh actor time to
//! observe the mark.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::epoch::{Epoch, EpochWatermarks, SeriesId};
use crate::store::{DataReferences, MetadataStore};
use crate::telemetry::ProtocolCounters;

/// Result of one prepare/delete/resurrect cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteCycleOutcome {
    /// The watermark pair published by PrepareDeleteTx.
    pub watermarks: EpochWatermarks,
    /// Rows destroyed.
    pub deleted: Vec<SeriesId>,
    /// Marked-and-expired rows that were concurrently re-referenced and
    /// had their marks undone instead.
    pub resurrected: Vec<SeriesId>,
}

/// One garbage collector instance.
///
/// Clone to create siblings: clones share the phase lock (and counters), so
/// phases stay mutually exclusive across the set.
pub struct GarbageCollector<B> {
    backend: Arc<B>,
    delay: Epoch,
    phase: Arc<Mutex<()>>,
    counters: Arc<ProtocolCounters>,
}

// Manual impl: only the Arc handles are cloned, so no `B: Clone` bound.
impl<B> Clone for GarbageCollector<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            delay: self.delay,
            phase: Arc::clone(&self.phase),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<B: MetadataStore + DataReferences> GarbageCollector<B> {
    /// Create a collector with the given grace window.
    pub fn new(backend: Arc<B>, delay: Epoch, counters: Arc<ProtocolCounters>) -> Self {
        Self { backend, delay, phase: Arc::new(Mutex::new(())), counters }
    }

    /// The configured grace window.
    #[must_use]
    pub const fn delay(&self) -> Epoch {
        self.delay
    }

    /// Advance `now`, publishing `current_epoch` if it was never published.
    ///
    /// Models wall-clock passage between transactions; takes no phase lock.
    pub fn advance_now(&self, by: Epoch) -> Epoch {
        let now = self.backend.advance_now(by);
        self.backend.publish_current_if_unset();
        now
    }

    /// DropChunkData: remove ids whose underlying data expired from the
    /// reference set. The only path by which an id stops being referenced.
    pub fn drop_chunk_data(&self, expired: &[SeriesId]) -> usize {
        let _phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = self.backend.expire_references(expired);
        if dropped > 0 {
            debug!(dropped, phase = "drop_chunk_data", "expired data references");
        }
        dropped
    }

    /// MarkUnused: stamp every stored, unreferenced, unmarked id with the
    /// observed published epoch.
    ///
    /// Candidates are read in a prior transaction; `mark_unused_batch`
    /// re-validates them at commit, so an id referenced between the two
    /// reads is skipped and an already-marked id keeps its original epoch.
    pub fn mark_unused(&self) -> Vec<SeriesId> {
        let _phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        let observed = self.backend.get_epochs().current;
        let unmarked = self.backend.stored_unmarked();
        let referenced: HashSet<SeriesId> = self.backend.currently_referenced(&unmarked);
        let candidates: Vec<SeriesId> =
            unmarked.into_iter().filter(|id| !referenced.contains(id)).collect();
        let marked = self.backend.mark_unused_batch(&candidates, observed);
        ProtocolCounters::add(&self.counters.series_marked, marked.len() as u64);
        if !marked.is_empty() {
            info!(count = marked.len(), epoch = observed, phase = "mark_unused", "marked unused series");
        }
        marked
    }

    /// PrepareDeleteTx → ActuallyDeleteTx → Resurrect: one logical deletion
    /// cycle as three sequential atomic steps.
    ///
    /// The delete re-checks its whole predicate at commit (a concurrent
    /// ingestor may have re-referenced a candidate since the marked set was
    /// read); ids that lost the race are resurrected, their data reference
    /// proving they are live again.
    pub fn run_delete_cycle(&self) -> DeleteCycleOutcome {
        let _phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());

        let watermarks = self.backend.begin_delete_cycle(self.delay);
        let observed = watermarks.delete;

        let marked = self.backend.marked_series();
        let outcome = self.backend.delete_if_still_ripe(&marked, observed);

        let resurrected = self.backend.resurrect_batch(&outcome.survivors);
        if resurrected < outcome.survivors.len() {
            // A cold-cache resolve can clear a survivor's mark between
            // ActuallyDeleteTx and this transaction; the end state is the
            // same (stored, unmarked).
            debug!(
                survivors = outcome.survivors.len(),
                resurrected,
                "some marks were already cleared by a concurrent resolve"
            );
        }

        ProtocolCounters::add(&self.counters.series_deleted, outcome.deleted.len() as u64);
        ProtocolCounters::add(&self.counters.delete_race_losses, outcome.survivors.len() as u64);
        if !outcome.deleted.is_empty() || !outcome.survivors.is_empty() {
            info!(
                deleted = outcome.deleted.len(),
                resurrected = outcome.survivors.len(),
                current = watermarks.current,
                delete = watermarks.delete,
                phase = "delete_cycle",
                "completed deletion cycle"
            );
        }
        DeleteCycleOutcome {
            watermarks,
            deleted: outcome.deleted,
            resurrected: outcome.survivors,
        }
    }
}
