//! Per-worker cache of known-valid series identifiers.
//!
//! Each ingest worker owns one [`WorkerCache`]: the set of ids it believes
//! valid plus a watermark recording the published epoch as of its last
//! refresh. Contents are written by exactly two parties: the owning worker
//! inserts, and the cache refresh actor removes (individually or wholesale).
//!
//! Two operations must not tear, and both take a single lock hold:
//!
//! - `lookup` reads the missing subset *and* the watermark together;
//!   splitting them permits an id to be reported absent just as it becomes
//!   present, or a watermark inconsistent with the contents;
//! - `scrub` clears or prunes and advances the watermark while excluding
//!   concurrent inserts for its whole duration.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::epoch::{Epoch, SeriesId, is_stale};
use crate::store::RefreshSnapshot;

struct CacheInner {
    ids: HashSet<SeriesId>,
    watermark: Epoch,
}

/// One worker's view: ids believed valid, last-synchronized epoch.
pub struct WorkerCache {
    worker: usize,
    inner: RwLock<CacheInner>,
}

impl std::fmt::Debug for WorkerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("WorkerCache")
            .field("worker", &self.worker)
            .field("entries", &inner.ids.len())
            .field("watermark", &inner.watermark)
            .finish()
    }
}

/// Atomic result of a cache lookup: the not-yet-cached subset of a batch
/// and the watermark captured in the same lock hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheView {
    /// Batch ids not present in the cache, in batch order, deduplicated.
    pub missing: Vec<SeriesId>,
    /// The cache watermark as of this lookup (`locally_observed_epoch`).
    pub watermark: Epoch,
}

/// What a scrub did to a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubAction {
    /// Watermark was at or below the delete watermark: contents could not
    /// be partially trusted and were dropped wholesale.
    Cleared {
        /// Entries removed.
        dropped: usize,
    },
    /// Watermark was fresh enough: only the snapshotted marked ids were
    /// removed.
    Pruned {
        /// Entries removed.
        dropped: usize,
    },
}

impl ScrubAction {
    /// Entries removed by this scrub, either way.
    #[must_use]
    pub const fn dropped(self) -> usize {
        match self {
            Self::Cleared { dropped } | Self::Pruned { dropped } => dropped,
        }
    }
}

impl WorkerCache {
    /// Create an empty cache for a worker, watermark at 0 (never refreshed).
    #[must_use]
    pub fn new(worker: usize) -> Self {
        Self {
            worker,
            inner: RwLock::new(CacheInner { ids: HashSet::new(), watermark: 0 }),
        }
    }

    /// Owning worker's identifier.
    #[must_use]
    pub const fn worker(&self) -> usize {
        self.worker
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Compute the subset of `batch` not in the cache and capture the
    /// watermark, atomically.
    #[must_use]
    pub fn lookup(&self, batch: &[SeriesId]) -> CacheView {
        let inner = self.read();
        let mut seen = HashSet::new();
        let missing = batch
            .iter()
            .copied()
            .filter(|id| !inner.ids.contains(id) && seen.insert(*id))
            .collect();
        CacheView { missing, watermark: inner.watermark }
    }

    /// Insert resolved ids. Owner-only write path.
    pub fn insert(&self, ids: &[SeriesId]) {
        if ids.is_empty() {
            return;
        }
        let mut inner = self.write();
        inner.ids.extend(ids.iter().copied());
    }

    /// Is `id` currently cached?
    #[must_use]
    pub fn contains(&self, id: SeriesId) -> bool {
        self.read().ids.contains(&id)
    }

    /// Number of cached ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().ids.len()
    }

    /// Whether the cache holds no ids.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().ids.is_empty()
    }

    /// Current watermark.
    #[must_use]
    pub fn watermark(&self) -> Epoch {
        self.read().watermark
    }

    /// Snapshot of the cached id set (diagnostics and invariant checks).
    #[must_use]
    pub fn ids(&self) -> HashSet<SeriesId> {
        self.read().ids.clone()
    }

    /// Apply one refresh snapshot: clear wholesale if the watermark is too
    /// stale to partially trust, otherwise prune exactly the snapshotted
    /// marked ids. Advances the watermark to the snapshotted published
    /// epoch. Cache refresh actor only.
    pub fn scrub(&self, snapshot: &RefreshSnapshot) -> ScrubAction {
        let mut inner = self.write();
        let action = if is_stale(inner.watermark, snapshot.delete) {
            // Contents may include ids deleted without this cache ever
            // observing the mark; the only safe recovery is a full flush.
            let dropped = inner.ids.len();
            inner.ids.clear();
            ScrubAction::Cleared { dropped }
        } else {
            let before = inner.ids.len();
            for id in &snapshot.marked {
                inner.ids.remove(id);
            }
            ScrubAction::Pruned { dropped: before - inner.ids.len() }
        };
        inner.watermark = snapshot.current;
        debug!(
            worker = self.worker,
            ?action,
            watermark = inner.watermark,
            "scrubbed worker cache"
        );
        action
    }
}
