//! Adversarial interleavings at transaction boundaries.
//!
//! The single-threaded suites exercise whole operations back to back; these
//! tests wedge another actor's transactions *between* the atomic steps of
//! one operation, which is exactly where read-committed isolation bites. A
//! delegating backend fires a one-shot hook at the boundary under test.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use seriesgc::cache::WorkerCache;
use seriesgc::collector::GarbageCollector;
use seriesgc::epoch::{Epoch, EpochWatermarks, SeriesId};
use seriesgc::error::CreateFault;
use seriesgc::ingest::Ingestor;
use seriesgc::invariants;
use seriesgc::refresh::CacheRefresher;
use seriesgc::store::{
    DataReferences, DeleteOutcome, InMemoryBackend, MetadataStore, RefreshSnapshot, Resolution,
    SeriesEntry,
};
use seriesgc::telemetry::ProtocolCounters;

type Hook = Box<dyn FnOnce(&InMemoryBackend) + Send>;

/// Delegates everything to an [`InMemoryBackend`], with one-shot hooks at
/// the two boundaries where a concurrent actor can be scheduled.
struct InterleavingBackend {
    inner: Arc<InMemoryBackend>,
    /// Runs right before the guarded reference union commits.
    before_reference_commit: Mutex<Option<Hook>>,
    /// Runs right after ActuallyDeleteTx, before the resurrect step.
    after_conditional_delete: Mutex<Option<Hook>>,
}

impl InterleavingBackend {
    fn new(inner: Arc<InMemoryBackend>) -> Self {
        Self {
            inner,
            before_reference_commit: Mutex::new(None),
            after_conditional_delete: Mutex::new(None),
        }
    }

    fn fire(slot: &Mutex<Option<Hook>>, inner: &InMemoryBackend) {
        let hook = slot.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(inner);
        }
    }
}

impl MetadataStore for InterleavingBackend {
    fn get_or_create_series(&self, id: SeriesId) -> Result<Resolution, CreateFault> {
        self.inner.get_or_create_series(id)
    }

    fn mark_unused_batch(&self, ids: &[SeriesId], epoch: Epoch) -> Vec<SeriesId> {
        self.inner.mark_unused_batch(ids, epoch)
    }

    fn delete_if_still_ripe(&self, ids: &[SeriesId], before: Epoch) -> DeleteOutcome {
        let outcome = self.inner.delete_if_still_ripe(ids, before);
        Self::fire(&self.after_conditional_delete, &self.inner);
        outcome
    }

    fn resurrect_batch(&self, ids: &[SeriesId]) -> usize {
        self.inner.resurrect_batch(ids)
    }

    fn stored_unmarked(&self) -> Vec<SeriesId> {
        self.inner.stored_unmarked()
    }

    fn marked_series(&self) -> Vec<SeriesId> {
        self.inner.marked_series()
    }

    fn entry(&self, id: SeriesId) -> SeriesEntry {
        self.inner.entry(id)
    }

    fn get_epochs(&self) -> EpochWatermarks {
        self.inner.get_epochs()
    }

    fn now(&self) -> Epoch {
        self.inner.now()
    }

    fn advance_now(&self, by: Epoch) -> Epoch {
        self.inner.advance_now(by)
    }

    fn publish_current_if_unset(&self) {
        self.inner.publish_current_if_unset();
    }

    fn begin_delete_cycle(&self, delay: Epoch) -> EpochWatermarks {
        self.inner.begin_delete_cycle(delay)
    }

    fn refresh_snapshot(&self) -> RefreshSnapshot {
        self.inner.refresh_snapshot()
    }
}

impl DataReferences for InterleavingBackend {
    fn add_references(&self, ids: &[SeriesId]) {
        self.inner.add_references(ids);
    }

    fn add_references_if_fresh(&self, ids: &[SeriesId], observed: Epoch) -> bool {
        Self::fire(&self.before_reference_commit, &self.inner);
        self.inner.add_references_if_fresh(ids, observed)
    }

    fn expire_references(&self, ids: &[SeriesId]) -> usize {
        self.inner.expire_references(ids)
    }

    fn currently_referenced(&self, ids: &[SeriesId]) -> HashSet<SeriesId> {
        self.inner.currently_referenced(ids)
    }

    fn referenced_snapshot(&self) -> HashSet<SeriesId> {
        self.inner.referenced_snapshot()
    }
}

/// A whole mark/prepare/delete cycle lands after the worker resolved its
/// batch but before the reference union. The guarded commit must observe
/// the advanced delete watermark, abort, and retry; committing would leave
/// a reference to a destroyed row.
#[test]
fn deletion_cycle_between_resolve_and_commit_forces_an_abort() {
    let inner = Arc::new(InMemoryBackend::new(1));
    let backend = Arc::new(InterleavingBackend::new(Arc::clone(&inner)));
    *backend.before_reference_commit.lock().unwrap() = Some(Box::new(|inner| {
        inner.mark_unused_batch(&[1], 1);
        inner.advance_now(2);
        let wm = inner.begin_delete_cycle(1); // current 3, delete 2
        let outcome = inner.delete_if_still_ripe(&[1], wm.delete);
        assert_eq!(outcome.deleted, vec![1]);
    }));

    let cache = Arc::new(WorkerCache::new(0));
    let counters = Arc::new(ProtocolCounters::default());
    let refresher = Arc::new(CacheRefresher::new(
        Arc::clone(&backend),
        vec![Arc::clone(&cache)],
        Arc::clone(&counters),
    ));
    let ingestor =
        Ingestor::new(0, Arc::clone(&cache), Arc::clone(&backend), refresher, counters, 8);

    let outcome = ingestor.ingest(&[1]).unwrap();
    assert_eq!(outcome.aborts, 1);
    // The retry re-created the destroyed row before committing.
    assert!(inner.entry(1).stored);
    assert_eq!(inner.referenced_snapshot(), [1].into_iter().collect());
    invariants::check(&inner.snapshot(), &[cache]).unwrap();
}

/// A cold-cache resolve clears a survivor's mark between ActuallyDeleteTx
/// and the collector's resurrect step. The cycle must treat the smaller
/// resurrect count as a normal outcome; the end state is identical.
#[test]
fn survivor_resurrected_by_a_concurrent_resolve_mid_cycle() {
    let inner = Arc::new(InMemoryBackend::new(1));
    inner.get_or_create_series(1).unwrap();
    inner.publish_current_if_unset();
    inner.mark_unused_batch(&[1], 1);
    inner.add_references(&[1]); // re-referenced while marked
    inner.advance_now(2); // now 3

    let backend = Arc::new(InterleavingBackend::new(Arc::clone(&inner)));
    *backend.after_conditional_delete.lock().unwrap() = Some(Box::new(|inner| {
        assert_eq!(inner.get_or_create_series(1), Ok(Resolution::Resurrected));
    }));

    let gc = GarbageCollector::new(backend, 1, Arc::default());
    let outcome = gc.run_delete_cycle();
    assert_eq!(outcome.watermarks, EpochWatermarks { current: 3, delete: 2 });
    assert!(outcome.deleted.is_empty());
    assert_eq!(outcome.resurrected, vec![1]);
    assert_eq!(inner.entry(1), SeriesEntry { stored: true, marked_at: None });
}
