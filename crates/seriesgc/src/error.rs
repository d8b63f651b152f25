//! Error types for seriesgc.

use thiserror::Error;

use crate::epoch::SeriesId;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for seriesgc.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An ingestion batch kept losing the epoch race past its retry budget.
    ///
    /// The protocol itself only ever needs one forced refresh to regain a
    /// fresh watermark; hitting this means the collaborator is misbehaving.
    #[error("ingest worker {worker} exhausted {attempts} retries after repeated epoch aborts")]
    RetriesExhausted {
        /// Worker whose batch could not commit.
        worker: usize,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// I/O errors (config file loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The grace window must be at least one epoch, otherwise a deletion
    /// cycle would publish `delete_epoch == current_epoch`.
    #[error("delay must be >= 1 epoch (got 0)")]
    ZeroDelay,

    /// At least one ingest worker is required.
    #[error("worker_count must be >= 1")]
    NoWorkers,

    /// The retry budget must allow at least one attempt.
    #[error("max_ingest_retries must be >= 1")]
    ZeroRetries,

    /// TOML parse failure.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A per-id metadata creation transaction aborted.
///
/// Recoverable at the granularity of the failing id: the id is excluded
/// from the cache update for this batch and retried naturally on the next
/// ingest of the same series.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("metadata creation aborted for series {id}")]
pub struct CreateFault {
    /// The series whose creation failed.
    pub id: SeriesId,
}
