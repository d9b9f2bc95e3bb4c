//! Ingestion configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::sorter::StalenessPolicy;
use crate::tokenizer::DEFAULT_MAX_CPUS;

/// A source whose newest event trails the rest of the trace by more than this
/// stops holding back the sorter.
pub const DEFAULT_MAX_LAG_NS: i64 = 5_000_000_000;

/// Configuration for [`TraceIngester`](crate::ingest::TraceIngester).
///
/// Every field has a default, so a config file only needs the values it
/// changes:
///
/// ```json
/// { "max_cpus": 256, "staleness": { "idle_flushes": 64 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// Bundles reporting a CPU at or above this are dropped.
    pub max_cpus: u32,
    pub staleness: StalenessPolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_cpus: DEFAULT_MAX_CPUS,
            staleness: StalenessPolicy {
                idle_flushes: None,
                max_lag_ns: Some(DEFAULT_MAX_LAG_NS),
            },
        }
    }
}

impl IngestConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid ingest config")
    }

    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to load {}", path.display()))
    }
}
