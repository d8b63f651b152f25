//! Canonical series metadata and live data references.
//!
//! Two collaborator contracts back the protocol: the metadata store (series
//! rows plus the epoch row) and the data-reference pipeline (which series
//! have live, recently-ingested data). [`InMemoryBackend`] implements both
//! over a single mutex, where **one lock acquisition models one isolated
//! transaction** under read-committed isolation: each call sees a consistent
//! snapshot for its own duration, but consecutive calls from the same
//! logical operation may observe different snapshots. Multi-call operations
//! (ingest, the deletion cycle) are designed to tolerate that; see the
//! commit-time re-validation in [`MetadataStore::delete_if_still_ripe`] and
//! [`MetadataStore::mark_unused_batch`].

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::epoch::{Epoch, EpochWatermarks, SeriesId, is_stale};
use crate::error::CreateFault;

/// One metadata row. An absent row reads as `stored = false, marked_at = None`.
///
/// Invariant: `marked_at.is_some()` implies `stored`: a row cannot be
/// marked without existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesEntry {
    /// Whether the row physically exists.
    pub stored: bool,
    /// Epoch at which the row was marked for deletion, if any.
    pub marked_at: Option<Epoch>,
}

impl SeriesEntry {
    /// The reading of an absent row.
    #[must_use]
    pub const fn absent() -> Self {
        Self { stored: false, marked_at: None }
    }
}

/// How `get_or_create_series` resolved an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Row did not exist and was created stored + unmarked.
    Created,
    /// Row existed, stored and unmarked. Nothing to do.
    Existing,
    /// Row existed but was marked for deletion; the mark was cleared.
    Resurrected,
}

/// Result of a conditional delete: which ids were actually destroyed and
/// which lost the race to a concurrent re-reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Ids whose rows were destroyed.
    pub deleted: Vec<SeriesId>,
    /// Ids that were ripe but re-referenced in flight; still marked, to be
    /// resurrected by the caller.
    pub survivors: Vec<SeriesId>,
}

/// One atomic snapshot for a cache refresh: the epoch pair and the full set
/// of currently-marked ids, captured in a single transaction.
#[derive(Debug, Clone)]
pub struct RefreshSnapshot {
    /// Published epoch at snapshot time.
    pub current: Epoch,
    /// Delete watermark at snapshot time.
    pub delete: Epoch,
    /// All ids with `marked_at` present at snapshot time.
    pub marked: HashSet<SeriesId>,
}

/// Full backend state, cloned out for invariant checks and diagnostics.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    /// Stored rows: id to `marked_at`.
    pub series: HashMap<SeriesId, Option<Epoch>>,
    /// Ids with live data references.
    pub referenced: HashSet<SeriesId>,
    /// Wall-clock-like counter.
    pub now: Epoch,
    /// The epoch watermark pair.
    pub watermarks: EpochWatermarks,
}

/// The series-metadata collaborator contract.
///
/// Every method is one isolated transaction. Conditional writes re-validate
/// their predicates at commit time; callers must never assume a candidate
/// set read in an earlier transaction is still accurate.
pub trait MetadataStore: Send + Sync {
    /// Create a stored, unmarked row if absent; clear the mark if present
    /// but marked. Idempotent per id. May abort independently per id within
    /// a batch; an aborted id must not be treated as resolved.
    fn get_or_create_series(&self, id: SeriesId) -> Result<Resolution, CreateFault>;

    /// Stamp `marked_at = epoch` on each id that is, at commit time, stored,
    /// unmarked, and not currently referenced. Returns the ids actually
    /// marked.
    fn mark_unused_batch(&self, ids: &[SeriesId], epoch: Epoch) -> Vec<SeriesId>;

    /// Conditionally destroy rows: an id is deleted only if, at commit time,
    /// it is still marked with `marked_at < before` and has no live data
    /// reference. Ripe-but-referenced ids are returned as survivors.
    fn delete_if_still_ripe(&self, ids: &[SeriesId], before: Epoch) -> DeleteOutcome;

    /// Clear `marked_at` on each id that is still stored. Never recreates a
    /// destroyed row. Returns how many marks were cleared.
    fn resurrect_batch(&self, ids: &[SeriesId]) -> usize;

    /// All stored, unmarked ids.
    fn stored_unmarked(&self) -> Vec<SeriesId>;

    /// All currently-marked ids.
    fn marked_series(&self) -> Vec<SeriesId>;

    /// Read one row (absent rows read as [`SeriesEntry::absent`]).
    fn entry(&self, id: SeriesId) -> SeriesEntry;

    /// Atomic read of the `(current_epoch, delete_epoch)` row.
    fn get_epochs(&self) -> EpochWatermarks;

    /// Current value of the `now` counter.
    fn now(&self) -> Epoch;

    /// Advance `now` by a non-negative increment; returns the new value.
    fn advance_now(&self, by: Epoch) -> Epoch;

    /// Publish `current_epoch = now` if it has never been published.
    fn publish_current_if_unset(&self);

    /// PrepareDeleteTx: in one transaction set `current_epoch = now` and
    /// `delete_epoch = current_epoch - delay` (saturating), returning the
    /// new pair. `current` derives from `now` inside the same transaction,
    /// so the pair can never tear.
    fn begin_delete_cycle(&self, delay: Epoch) -> EpochWatermarks;

    /// One-transaction snapshot of the epoch pair plus all marked ids, for
    /// the cache refresh actor.
    fn refresh_snapshot(&self) -> RefreshSnapshot;
}

/// The data-reference collaborator contract (the ingestion/storage pipeline).
pub trait DataReferences: Send + Sync {
    /// Union ids into the live reference set.
    fn add_references(&self, ids: &[SeriesId]);

    /// Guarded union: add ids to the live reference set only if `observed`
    /// is still fresh against the delete watermark, with the check and the
    /// union in one transaction. Returns whether the union committed.
    ///
    /// The ingest commit path must use this rather than a separate epoch
    /// read followed by [`DataReferences::add_references`]: a whole deletion
    /// cycle can land between two transactions, and a reference committed
    /// after its metadata row was destroyed is unrecoverable.
    fn add_references_if_fresh(&self, ids: &[SeriesId], observed: Epoch) -> bool;

    /// Remove ids whose underlying data chunks aged out. The only path by
    /// which an id leaves the reference set. Returns how many were removed.
    fn expire_references(&self, ids: &[SeriesId]) -> usize;

    /// Subset of `ids` with a live reference right now.
    fn currently_referenced(&self, ids: &[SeriesId]) -> HashSet<SeriesId>;

    /// The whole live reference set.
    fn referenced_snapshot(&self) -> HashSet<SeriesId>;
}

struct Inner {
    /// id -> marked_at. Presence of the key is the `stored` flag.
    series: HashMap<SeriesId, Option<Epoch>>,
    refs: HashSet<SeriesId>,
    now: Epoch,
    watermarks: EpochWatermarks,
    /// One-shot per-id creation aborts (test hook, see `inject_create_fault`).
    create_faults: HashSet<SeriesId>,
}

/// In-memory implementation of both collaborator contracts.
///
/// Thread-safe; every trait method takes the lock exactly once, giving the
/// per-statement atomicity the protocol is specified against.
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("InMemoryBackend")
            .field("series", &inner.series.len())
            .field("referenced", &inner.refs.len())
            .field("now", &inner.now)
            .field("watermarks", &inner.watermarks)
            .finish()
    }
}

impl InMemoryBackend {
    /// Create an empty backend with `now` at the given starting value and
    /// an unpublished epoch pair.
    #[must_use]
    pub fn new(start_now: Epoch) -> Self {
        Self {
            inner: Mutex::new(Inner {
                series: HashMap::new(),
                refs: HashSet::new(),
                now: start_now,
                watermarks: EpochWatermarks::unpublished(),
                create_faults: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arrange for the next `get_or_create_series(id)` to abort (one-shot).
    ///
    /// Models the per-id creation transaction failing independently within
    /// a batch; the following attempt succeeds.
    pub fn inject_create_fault(&self, id: SeriesId) {
        self.lock().create_faults.insert(id);
    }

    /// Clone out the full state for invariant checks.
    #[must_use]
    pub fn snapshot(&self) -> BackendSnapshot {
        let inner = self.lock();
        BackendSnapshot {
            series: inner.series.clone(),
            referenced: inner.refs.clone(),
            now: inner.now,
            watermarks: inner.watermarks,
        }
    }
}

impl MetadataStore for InMemoryBackend {
    fn get_or_create_series(&self, id: SeriesId) -> Result<Resolution, CreateFault> {
        let mut inner = self.lock();
        if inner.create_faults.remove(&id) {
            trace!(series = id, "injected creation abort");
            return Err(CreateFault { id });
        }
        let resolution = match inner.series.get_mut(&id) {
            None => {
                inner.series.insert(id, None);
                Resolution::Created
            }
            Some(marked_at @ Some(_)) => {
                *marked_at = None;
                Resolution::Resurrected
            }
            Some(None) => Resolution::Existing,
        };
        trace!(series = id, ?resolution, "resolved series");
        Ok(resolution)
    }

    fn mark_unused_batch(&self, ids: &[SeriesId], epoch: Epoch) -> Vec<SeriesId> {
        let mut inner = self.lock();
        let mut marked = Vec::new();
        for &id in ids {
            // Commit-time re-check: stored, unmarked, and unreferenced.
            if inner.refs.contains(&id) {
                continue;
            }
            if let Some(marked_at @ None) = inner.series.get_mut(&id) {
                *marked_at = Some(epoch);
                marked.push(id);
            }
        }
        if !marked.is_empty() {
            debug!(count = marked.len(), epoch, "marked unused series");
        }
        marked
    }

    fn delete_if_still_ripe(&self, ids: &[SeriesId], before: Epoch) -> DeleteOutcome {
        let mut inner = self.lock();
        let mut outcome = DeleteOutcome::default();
        for &id in ids {
            // Re-validate the whole predicate at commit time: a concurrent
            // ingestor may have re-referenced or resurrected the id since
            // the caller read its candidate set.
            let ripe = matches!(inner.series.get(&id), Some(Some(m)) if *m < before);
            if !ripe {
                continue;
            }
            if inner.refs.contains(&id) {
                outcome.survivors.push(id);
            } else {
                inner.series.remove(&id);
                outcome.deleted.push(id);
            }
        }
        if !outcome.deleted.is_empty() || !outcome.survivors.is_empty() {
            debug!(
                deleted = outcome.deleted.len(),
                survivors = outcome.survivors.len(),
                before,
                "conditional delete"
            );
        }
        outcome
    }

    fn resurrect_batch(&self, ids: &[SeriesId]) -> usize {
        let mut inner = self.lock();
        let mut cleared = 0;
        for &id in ids {
            if let Some(marked_at @ Some(_)) = inner.series.get_mut(&id) {
                *marked_at = None;
                cleared += 1;
            }
        }
        if cleared > 0 {
            debug!(cleared, "resurrected marked series");
        }
        cleared
    }

    fn stored_unmarked(&self) -> Vec<SeriesId> {
        let inner = self.lock();
        inner
            .series
            .iter()
            .filter(|(_, marked_at)| marked_at.is_none())
            .map(|(&id, _)| id)
            .collect()
    }

    fn marked_series(&self) -> Vec<SeriesId> {
        let inner = self.lock();
        inner
            .series
            .iter()
            .filter(|(_, marked_at)| marked_at.is_some())
            .map(|(&id, _)| id)
            .collect()
    }

    fn entry(&self, id: SeriesId) -> SeriesEntry {
        let inner = self.lock();
        inner.series.get(&id).map_or(SeriesEntry::absent(), |&marked_at| SeriesEntry {
            stored: true,
            marked_at,
        })
    }

    fn get_epochs(&self) -> EpochWatermarks {
        self.lock().watermarks
    }

    fn now(&self) -> Epoch {
        self.lock().now
    }

    fn advance_now(&self, by: Epoch) -> Epoch {
        let mut inner = self.lock();
        inner.now = inner.now.saturating_add(by);
        inner.now
    }

    fn publish_current_if_unset(&self) {
        let mut inner = self.lock();
        if inner.watermarks.current == 0 {
            inner.watermarks.current = inner.now;
        }
    }

    fn begin_delete_cycle(&self, delay: Epoch) -> EpochWatermarks {
        let mut inner = self.lock();
        let current = inner.now;
        inner.watermarks = EpochWatermarks {
            current,
            delete: current.saturating_sub(delay),
        };
        debug!(
            current = inner.watermarks.current,
            delete = inner.watermarks.delete,
            "advanced epoch watermarks"
        );
        inner.watermarks
    }

    fn refresh_snapshot(&self) -> RefreshSnapshot {
        let inner = self.lock();
        RefreshSnapshot {
            current: inner.watermarks.current,
            delete: inner.watermarks.delete,
            marked: inner
                .series
                .iter()
                .filter(|(_, marked_at)| marked_at.is_some())
                .map(|(&id, _)| id)
                .collect(),
        }
    }
}

impl DataReferences for InMemoryBackend {
    fn add_references(&self, ids: &[SeriesId]) {
        let mut inner = self.lock();
        inner.refs.extend(ids.iter().copied());
    }

    fn add_references_if_fresh(&self, ids: &[SeriesId], observed: Epoch) -> bool {
        let mut inner = self.lock();
        if is_stale(observed, inner.watermarks.delete) {
            return false;
        }
        inner.refs.extend(ids.iter().copied());
        true
    }

    fn expire_references(&self, ids: &[SeriesId]) -> usize {
        let mut inner = self.lock();
        let before = inner.refs.len();
        for id in ids {
            inner.refs.remove(id);
        }
        before - inner.refs.len()
    }

    fn currently_referenced(&self, ids: &[SeriesId]) -> HashSet<SeriesId> {
        let inner = self.lock();
        ids.iter().copied().filter(|id| inner.refs.contains(id)).collect()
    }

    fn referenced_snapshot(&self) -> HashSet<SeriesId> {
        self.lock().refs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_resolve_is_idempotent() {
        let backend = InMemoryBackend::new(1);
        assert_eq!(backend.get_or_create_series(7), Ok(Resolution::Created));
        assert_eq!(backend.get_or_create_series(7), Ok(Resolution::Existing));
        assert_eq!(backend.entry(7), SeriesEntry { stored: true, marked_at: None });
    }

    #[test]
    fn resolve_clears_a_mark() {
        let backend = InMemoryBackend::new(1);
        backend.get_or_create_series(7).unwrap();
        assert_eq!(backend.mark_unused_batch(&[7], 2), vec![7]);
        assert_eq!(backend.get_or_create_series(7), Ok(Resolution::Resurrected));
        assert_eq!(backend.entry(7).marked_at, None);
    }

    #[test]
    fn mark_skips_referenced_marked_and_absent_ids() {
        let backend = InMemoryBackend::new(1);
        backend.get_or_create_series(1).unwrap();
        backend.get_or_create_series(2).unwrap();
        backend.get_or_create_series(3).unwrap();
        backend.add_references(&[1]);
        backend.mark_unused_batch(&[3], 1);

        // 1 is referenced, 3 is already marked, 9 is absent.
        let marked = backend.mark_unused_batch(&[1, 2, 3, 9], 2);
        assert_eq!(marked, vec![2]);
        assert_eq!(backend.entry(3).marked_at, Some(1));
        assert!(!backend.entry(9).stored);
    }

    #[test]
    fn delete_revalidates_ripeness_and_references() {
        let backend = InMemoryBackend::new(1);
        for id in [1, 2, 3] {
            backend.get_or_create_series(id).unwrap();
        }
        backend.mark_unused_batch(&[1, 2], 2);
        backend.mark_unused_batch(&[3], 5);
        backend.add_references(&[2]);

        let outcome = backend.delete_if_still_ripe(&[1, 2, 3], 3);
        assert_eq!(outcome.deleted, vec![1]);
        assert_eq!(outcome.survivors, vec![2]);
        // 3 was marked too recently; untouched.
        assert_eq!(backend.entry(3).marked_at, Some(5));
        assert!(!backend.entry(1).stored);
        assert!(backend.entry(2).stored);
    }

    #[test]
    fn resurrect_never_recreates_a_destroyed_row() {
        let backend = InMemoryBackend::new(1);
        backend.get_or_create_series(1).unwrap();
        backend.mark_unused_batch(&[1], 1);
        let outcome = backend.delete_if_still_ripe(&[1], 5);
        assert_eq!(outcome.deleted, vec![1]);

        assert_eq!(backend.resurrect_batch(&[1]), 0);
        assert!(!backend.entry(1).stored);
    }

    #[test]
    fn epoch_row_publish_and_delete_cycle() {
        let backend = InMemoryBackend::new(3);
        assert_eq!(backend.get_epochs(), EpochWatermarks::unpublished());

        backend.publish_current_if_unset();
        assert_eq!(backend.get_epochs().current, 3);
        // Second publish is a no-op.
        backend.advance_now(2);
        backend.publish_current_if_unset();
        assert_eq!(backend.get_epochs().current, 3);

        let wm = backend.begin_delete_cycle(1);
        assert_eq!(wm, EpochWatermarks { current: 5, delete: 4 });
        assert_eq!(backend.get_epochs(), wm);
    }

    #[test]
    fn delete_watermark_saturates_at_zero() {
        let backend = InMemoryBackend::new(1);
        let wm = backend.begin_delete_cycle(4);
        assert_eq!(wm, EpochWatermarks { current: 1, delete: 0 });
    }

    #[test]
    fn create_fault_is_one_shot() {
        let backend = InMemoryBackend::new(1);
        backend.inject_create_fault(7);
        assert_eq!(backend.get_or_create_series(7), Err(CreateFault { id: 7 }));
        assert!(!backend.entry(7).stored);
        assert_eq!(backend.get_or_create_series(7), Ok(Resolution::Created));
    }

    #[test]
    fn guarded_union_rejects_a_stale_observer() {
        let backend = InMemoryBackend::new(1);
        backend.get_or_create_series(1).unwrap();
        backend.advance_now(4);
        backend.begin_delete_cycle(2); // current 5, delete 3

        assert!(!backend.add_references_if_fresh(&[1], 3));
        assert!(backend.referenced_snapshot().is_empty());

        assert!(backend.add_references_if_fresh(&[1], 4));
        assert_eq!(backend.referenced_snapshot(), [1].into_iter().collect());
    }

    #[test]
    fn expire_is_the_only_removal_path_and_reports_count() {
        let backend = InMemoryBackend::new(1);
        backend.add_references(&[1, 2, 3]);
        assert_eq!(backend.expire_references(&[2, 9]), 1);
        assert_eq!(backend.referenced_snapshot().len(), 2);
        assert_eq!(backend.currently_referenced(&[1, 2, 3]), [1, 3].into_iter().collect());
    }
}
