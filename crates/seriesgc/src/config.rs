//! Protocol configuration.
//!
//! All knobs are serde-deserializable with defaults, so a partial TOML
//! document is enough:
//!
//! ```toml
//! delay = 2
//! worker_count = 4
//!
//! [gc]
//! tick_ms = 500
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::epoch::Epoch;
use crate::error::{ConfigError, Error, Result};

/// Garbage-collector scheduling knobs (used by the actor harness; the
/// protocol itself is tick-agnostic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Milliseconds between collector passes.
    pub tick_ms: u64,
    /// How much to advance `now` per pass (models wall-clock passage).
    pub advance_per_tick: Epoch,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self { tick_ms: 1_000, advance_per_tick: 1 }
    }
}

/// Top-level protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Grace window: minimum number of epochs a marked series must wait
    /// before becoming delete-eligible. Must be >= 1.
    pub delay: Epoch,
    /// Number of per-worker caches / ingest workers.
    pub worker_count: usize,
    /// Forced-refresh retries before an ingest batch gives up.
    pub max_ingest_retries: u32,
    /// Milliseconds between fleet-wide cache refresh sweeps (actor harness).
    pub refresh_tick_ms: u64,
    /// Collector scheduling.
    pub gc: GcConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            delay: 2,
            worker_count: 4,
            max_ingest_retries: 8,
            refresh_tick_ms: 1_000,
            gc: GcConfig::default(),
        }
    }
}

impl ProtocolConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.delay == 0 {
            return Err(ConfigError::ZeroDelay.into());
        }
        if self.worker_count == 0 {
            return Err(ConfigError::NoWorkers.into());
        }
        if self.max_ingest_retries == 0 {
            return Err(ConfigError::ZeroRetries.into());
        }
        Ok(())
    }

    /// Parse and validate from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        Self::from_toml_str(&raw)
    }
}
