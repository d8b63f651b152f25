//! Cache refresh actor.
//!
//! Exactly one refresher exists per fleet. Each reconciliation targets one
//! worker cache: take a single atomic snapshot of the epoch pair plus the
//! currently-marked ids, then apply the clear-vs-prune policy
//! ([`WorkerCache::scrub`]). A cache that has not refreshed since before
//! `delete_epoch` cannot distinguish "never marked" from "marked and
//! already deleted", so it is flushed wholesale; a fresher cache has
//! necessarily observed every mark that could since have expired (marks
//! must age at least the grace window before deletion), so pruning the
//! snapshotted marked set is sufficient.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::cache::{ScrubAction, WorkerCache};
use crate::store::MetadataStore;
use crate::telemetry::ProtocolCounters;

/// Summary of one fleet-wide refresh sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSweep {
    /// Caches flushed wholesale.
    pub cleared: usize,
    /// Caches pruned precisely.
    pub pruned: usize,
    /// Total entries removed across the fleet.
    pub dropped: usize,
}

/// The single cache refresh actor, serialized across the fleet.
pub struct CacheRefresher<B> {
    backend: Arc<B>,
    fleet: Vec<Arc<WorkerCache>>,
    /// Serializes reconciliations: periodic sweeps and forced refreshes
    /// from aborting ingestors never overlap.
    serial: Mutex<()>,
    counters: Arc<ProtocolCounters>,
}

impl<B: MetadataStore> CacheRefresher<B> {
    /// Create the refresher for a fleet of worker caches.
    pub fn new(
        backend: Arc<B>,
        fleet: Vec<Arc<WorkerCache>>,
        counters: Arc<ProtocolCounters>,
    ) -> Self {
        Self { backend, fleet, serial: Mutex::new(()), counters }
    }

    /// The caches this refresher reconciles.
    #[must_use]
    pub fn fleet(&self) -> &[Arc<WorkerCache>] {
        &self.fleet
    }

    /// Reconcile one worker cache against the metadata store.
    ///
    /// Also the forced-refresh entry point for an ingestor whose commit
    /// aborted on the epoch guard.
    pub fn refresh_worker(&self, cache: &WorkerCache) -> ScrubAction {
        let _serialized = self.serial.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = self.backend.refresh_snapshot();
        let action = cache.scrub(&snapshot);
        match action {
            ScrubAction::Cleared { dropped } => {
                ProtocolCounters::bump(&self.counters.cache_clears);
                info!(
                    worker = cache.worker(),
                    dropped,
                    delete = snapshot.delete,
                    "cache too stale to trust, cleared"
                );
            }
            ScrubAction::Pruned { dropped } => {
                ProtocolCounters::bump(&self.counters.cache_prunes);
                debug!(worker = cache.worker(), dropped, "cache pruned");
            }
        }
        action
    }

    /// Reconcile every cache in the fleet, one at a time.
    pub fn refresh_all(&self) -> RefreshSweep {
        let mut sweep = RefreshSweep::default();
        for cache in &self.fleet {
            match self.refresh_worker(cache) {
                ScrubAction::Cleared { dropped } => {
                    sweep.cleared += 1;
                    sweep.dropped += dropped;
                }
                ScrubAction::Pruned { dropped } => {
                    sweep.pruned += 1;
                    sweep.dropped += dropped;
                }
            }
        }
        sweep
    }
}
