//! Ingestion actor.
//!
//! Accepts a batch of incoming series ids and runs the five-step resolve
//! loop, each step one isolated transaction:
//!
//! 1. publish `current_epoch` if it has never been published;
//! 2. accept the batch;
//! 3. atomic cache lookup + watermark capture (`locally_observed_epoch`);
//! 4. resolve/create metadata per missing id, then insert the successes
//!    into this worker's cache;
//! 5. guarded commit of the data references, one transaction: the union
//!    happens only if the captured watermark is still fresh against
//!    `delete_epoch`; a stale watermark means this worker's view is too old
//!    to claim these ids are live; abort, force a refresh of this cache,
//!    retry.
//!
//! The abort path is the protocol's only retry loop and is not a
//! user-visible error; exhausting the (configurable) retry budget is.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::WorkerCache;
use crate::epoch::SeriesId;
use crate::error::{Error, Result};
use crate::refresh::CacheRefresher;
use crate::store::{DataReferences, MetadataStore, Resolution};
use crate::telemetry::ProtocolCounters;

/// What one ingest batch did, across all attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Ids whose metadata rows were created.
    pub created: Vec<SeriesId>,
    /// Ids that were marked for deletion and resurrected by this ingest.
    pub resurrected: Vec<SeriesId>,
    /// Ids whose creation transaction aborted (excluded from the cache and
    /// the reference commit; retried on the next ingest of the same id).
    pub failed: Vec<SeriesId>,
    /// Epoch-guard aborts before the batch committed.
    pub aborts: u32,
}

/// One ingestion worker: owns a cache, resolves series, records references.
pub struct Ingestor<B> {
    worker: usize,
    cache: Arc<WorkerCache>,
    backend: Arc<B>,
    refresher: Arc<CacheRefresher<B>>,
    counters: Arc<ProtocolCounters>,
    max_retries: u32,
}

impl<B: MetadataStore + DataReferences> Ingestor<B> {
    /// Create a worker over its own cache and the shared collaborators.
    pub fn new(
        worker: usize,
        cache: Arc<WorkerCache>,
        backend: Arc<B>,
        refresher: Arc<CacheRefresher<B>>,
        counters: Arc<ProtocolCounters>,
        max_retries: u32,
    ) -> Self {
        Self { worker, cache, backend, refresher, counters, max_retries }
    }

    /// This worker's identifier.
    #[must_use]
    pub const fn worker(&self) -> usize {
        self.worker
    }

    /// This worker's cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<WorkerCache> {
        &self.cache
    }

    /// Ingest one batch of series ids.
    pub fn ingest(&self, batch: &[SeriesId]) -> Result<IngestOutcome> {
        if batch.is_empty() {
            return Ok(IngestOutcome::default());
        }

        self.backend.publish_current_if_unset();

        let mut outcome = IngestOutcome::default();
        for _attempt in 0..self.max_retries {
            // Missing subset and watermark must come from one lock hold.
            let view = self.cache.lookup(batch);

            let mut insertable = Vec::with_capacity(view.missing.len());
            let mut failed = Vec::new();
            for &id in &view.missing {
                match self.backend.get_or_create_series(id) {
                    Ok(Resolution::Created) => {
                        ProtocolCounters::bump(&self.counters.series_created);
                        outcome.created.push(id);
                        insertable.push(id);
                    }
                    Ok(Resolution::Resurrected) => {
                        ProtocolCounters::bump(&self.counters.ingest_resurrections);
                        outcome.resurrected.push(id);
                        insertable.push(id);
                    }
                    Ok(Resolution::Existing) => insertable.push(id),
                    Err(fault) => {
                        ProtocolCounters::bump(&self.counters.create_faults);
                        warn!(worker = self.worker, series = id, %fault, "series creation aborted");
                        failed.push(id);
                    }
                }
            }
            self.cache.insert(&insertable);

            // Step 5: guarded commit. Freshness check and reference union
            // share one transaction; re-reading the epoch pair separately
            // would leave room for a whole deletion cycle between the check
            // and the union.
            let excluded: HashSet<SeriesId> = failed.iter().copied().collect();
            let references: Vec<SeriesId> = batch
                .iter()
                .copied()
                .filter(|id| !excluded.contains(id))
                .collect();
            if self.backend.add_references_if_fresh(&references, view.watermark) {
                outcome.failed = failed;
                return Ok(outcome);
            }

            outcome.aborts += 1;
            ProtocolCounters::bump(&self.counters.epoch_aborts);
            ProtocolCounters::bump(&self.counters.forced_refreshes);
            debug!(
                worker = self.worker,
                observed = view.watermark,
                "stale watermark, refreshing cache before retry"
            );
            self.refresher.refresh_worker(&self.cache);
        }

        Err(Error::RetriesExhausted { worker: self.worker, attempts: self.max_retries })
    }
}
