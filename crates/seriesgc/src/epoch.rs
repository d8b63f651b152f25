//! Logical time for the series lifecycle.
//!
//! Three named epoch values exist system-wide:
//!
//! - `now`: wall-clock-like counter, advanced only by the garbage
//!   collector between transactions.
//! - `current_epoch`: the published epoch visible to readers, `<= now`.
//! - `delete_epoch`: trailing watermark, `current_epoch - delay`, or 0 if
//!   no deletion cycle has run yet.
//!
//! `current_epoch` and `delete_epoch` form one logical row and are only
//! ever read or written together (see [`EpochWatermarks`]); the backing
//! store owns the row and serializes updates against reads.

use serde::{Deserialize, Serialize};

/// Opaque series identifier. No structure beyond identity.
pub type SeriesId = u64;

/// Logical time value. Absence (an entry never marked, a watermark never
/// published) is always `Option<Epoch>` or the documented 0 sentinel on the
/// delete watermark, never a magic in-band value elsewhere.
pub type Epoch = u64;

/// The `(current_epoch, delete_epoch)` pair, snapshotted atomically.
///
/// Invariant: `current > delete` unless `delete == 0` (no deletion cycle
/// has run yet).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochWatermarks {
    /// Published epoch visible to readers.
    pub current: Epoch,
    /// Trailing deletion watermark. 0 means no deletion cycle has run.
    pub delete: Epoch,
}

impl EpochWatermarks {
    /// The pair before any epoch has been published.
    #[must_use]
    pub const fn unpublished() -> Self {
        Self { current: 0, delete: 0 }
    }
}

/// Is a cache watermark too stale to trust against this delete watermark?
///
/// A watermark at or below `delete` cannot distinguish "id never marked"
/// from "id marked and already deleted". While `delete == 0` nothing has
/// ever been deleted, so no watermark is stale.
#[must_use]
pub const fn is_stale(watermark: Epoch, delete: Epoch) -> bool {
    delete > 0 && watermark <= delete
}
