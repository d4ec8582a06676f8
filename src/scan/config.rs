//! Per-request scan configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, ScanError};

/// Knobs for one scan request. Immutable for the request's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Bytes analyzed as one unit
    pub chunk_size: usize,
    /// Memory budget for the request; enforced by the ingestion layer
    pub max_memory_bytes: u64,
    /// Row-sampling fraction, consumed by the structured file readers
    pub sample_fraction: f64,
    /// Insert batch size, consumed by the result storage layer
    pub batch_size: usize,
    /// Pause before analyzing a unit while memory pressure is unsafe
    pub pressure_backoff_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_memory_bytes: 1024 * 1024 * 1024,
            sample_fraction: 0.2,
            batch_size: 1000,
            pressure_backoff_ms: 100,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(ScanError::Config("chunk_size must be positive".into()));
        }
        if !(self.sample_fraction > 0.0 && self.sample_fraction <= 1.0) {
            return Err(ScanError::Config(format!(
                "sample_fraction must be in (0, 1], got {}",
                self.sample_fraction
            )));
        }
        if self.batch_size == 0 {
            return Err(ScanError::Config("batch_size must be positive".into()));
        }
        Ok(())
    }

    pub fn pressure_backoff(&self) -> Duration {
        Duration::from_millis(self.pressure_backoff_ms)
    }
}
