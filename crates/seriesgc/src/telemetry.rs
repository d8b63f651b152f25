//! Protocol counters.
//!
//! Cheap atomic counters on the hot paths, snapshotted for diagnostics.
//! There is no external metrics backend; callers serialize the snapshot
//! wherever they report health.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Shared counters, bumped by the actors.
#[derive(Debug, Default)]
pub struct ProtocolCounters {
    /// Epoch-guard aborts in ingest step 5.
    pub epoch_aborts: AtomicU64,
    /// Cache refreshes forced by an ingest abort.
    pub forced_refreshes: AtomicU64,
    /// Series rows created.
    pub series_created: AtomicU64,
    /// Marks cleared by ingest-side resolution.
    pub ingest_resurrections: AtomicU64,
    /// Per-id creation aborts.
    pub create_faults: AtomicU64,
    /// Series marked unused.
    pub series_marked: AtomicU64,
    /// Series rows destroyed.
    pub series_deleted: AtomicU64,
    /// Deletes that lost the race to a concurrent re-reference.
    pub delete_race_losses: AtomicU64,
    /// Wholesale cache clears during refresh.
    pub cache_clears: AtomicU64,
    /// Precise cache prunes during refresh.
    pub cache_prunes: AtomicU64,
}

impl ProtocolCounters {
    /// Add `n` to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot every counter.
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            epoch_aborts: self.epoch_aborts.load(Ordering::Relaxed),
            forced_refreshes: self.forced_refreshes.load(Ordering::Relaxed),
            series_created: self.series_created.load(Ordering::Relaxed),
            ingest_resurrections: self.ingest_resurrections.load(Ordering::Relaxed),
            create_faults: self.create_faults.load(Ordering::Relaxed),
            series_marked: self.series_marked.load(Ordering::Relaxed),
            series_deleted: self.series_deleted.load(Ordering::Relaxed),
            delete_race_losses: self.delete_race_losses.load(Ordering::Relaxed),
            cache_clears: self.cache_clears.load(Ordering::Relaxed),
            cache_prunes: self.cache_prunes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ProtocolCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub epoch_aborts: u64,
    pub forced_refreshes: u64,
    pub series_created: u64,
    pub ingest_resurrections: u64,
    pub create_faults: u64,
    pub series_marked: u64,
    pub series_deleted: u64,
    pub delete_race_losses: u64,
    pub cache_clears: u64,
    pub cache_prunes: u64,
}
