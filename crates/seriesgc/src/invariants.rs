//! Safety invariants, checked by the test harness after every atomic step.
//!
//! These are the properties that must hold in every reachable state:
//!
//! 1. epoch ordering: `current_epoch <= now`, and
//!    `current_epoch > delete_epoch` unless `delete_epoch == 0`;
//! 2. referential safety: every id in the data reference set has a stored
//!    metadata row;
//! 3. mark consistency: no row is marked while not stored; enforced
//!    structurally here, since a mark can only live on a present row;
//! 4. cache freshness: a worker cache whose watermark is above the delete
//!    watermark never holds an id whose row has been destroyed. Caches at
//!    or below the delete watermark are exempt; the refresh actor flushes
//!    them wholesale before they are trusted again.
//!
//! Not wired into production paths; [`check`] clones state and is meant for
//! the simulator and tests.

use std::sync::Arc;

use thiserror::Error;

use crate::cache::WorkerCache;
use crate::epoch::{Epoch, SeriesId, is_stale};
use crate::store::BackendSnapshot;

/// A violated safety property, with enough context to debug the schedule.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("epoch ordering broken: now={now} current={current} delete={delete}")]
    EpochOrder { now: Epoch, current: Epoch, delete: Epoch },

    #[error("series {id} is referenced but has no stored metadata row")]
    ReferencedNotStored { id: SeriesId },

    #[error(
        "worker {worker} cache (watermark {watermark}, delete {delete}) holds destroyed series {id}"
    )]
    FreshCacheHoldsDestroyed { worker: usize, id: SeriesId, watermark: Epoch, delete: Epoch },
}

/// Check every invariant against a backend snapshot and the cache fleet.
pub fn check(
    snapshot: &BackendSnapshot,
    caches: &[Arc<WorkerCache>],
) -> Result<(), InvariantViolation> {
    let wm = snapshot.watermarks;
    if wm.current > snapshot.now || (wm.delete != 0 && wm.current <= wm.delete) {
        return Err(InvariantViolation::EpochOrder {
            now: snapshot.now,
            current: wm.current,
            delete: wm.delete,
        });
    }

    for &id in &snapshot.referenced {
        if !snapshot.series.contains_key(&id) {
            return Err(InvariantViolation::ReferencedNotStored { id });
        }
    }

    for cache in caches {
        let watermark = cache.watermark();
        if is_stale(watermark, wm.delete) {
            continue;
        }
        for id in cache.ids() {
            if !snapshot.series.contains_key(&id) {
                return Err(InvariantViolation::FreshCacheHoldsDestroyed {
                    worker: cache.worker(),
                    id,
                    watermark,
                    delete: wm.delete,
                });
            }
        }
    }

    Ok(())
}
