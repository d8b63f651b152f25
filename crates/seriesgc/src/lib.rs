//! seriesgc: epoch-based series-cache invalidation
//!
//! Keeps per-worker in-memory caches of known-valid series identifiers
//! consistent with a canonical, garbage-collected series-metadata table.
//! Ingest workers concurrently create and reference series while collector
//! and refresh actors mark unused identifiers, delete them after a grace
//! window, and prune the caches, all under read-committed-style isolation
//! where every atomic step may observe a different snapshot of shared
//! state.
//!
//! # Architecture
//!
//! ```text
//! Ingest workers ──► Metadata store + reference set ──► own cache
//!                         ▲               ▲
//!        Garbage collector┘               │
//!        (mark / delete / resurrect)      │
//!                                         │
//!        Cache refresh actor ─────────────┴──► every worker cache
//!        (clear-vs-prune, single authority for removals)
//! ```
//!
//! Two guarantees hold in every reachable state: no cache serves an
//! identifier whose metadata has been deleted, and no concurrently-ingested
//! reference to a mid-deletion identifier is lost.
//!
//! # Modules
//!
//! - `epoch`: logical time, the `(current, delete)` watermark pair
//! - `store`: collaborator contracts and the in-memory backend
//! - `cache`: per-worker cache with atomic lookup + watermark capture
//! - `ingest`: ingestion actor with the optimistic epoch guard
//! - `collector`: garbage collector phases and the deletion cycle
//! - `refresh`: the single cache refresh actor (clear vs prune)
//! - `fleet`: thread-per-actor harness over crossbeam channels
//! - `invariants`: safety checks for the test harness
//! - `sim`: seeded interleaving driver
//! - `config`: protocol knobs (grace window, retries, tick cadence)
//! - `logging`: tracing subscriber setup
//! - `telemetry`: protocol counters
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod cache;
pub mod collector;
pub mod config;
pub mod epoch;
pub mod error;
pub mod fleet;
pub mod ingest;
pub mod invariants;
pub mod logging;
pub mod refresh;
pub mod sim;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
