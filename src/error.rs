//! Error types for the PII scanning core

use thiserror::Error;

/// Result type alias for scanner operations
pub type Result<T> = std::result::Result<T, ScanError>;

/// Main error type for the scanning core
#[derive(Error, Debug)]
pub enum ScanError {
    /// Memory pressure is at or above the breaker threshold. Usually a
    /// boolean signal from the guard rather than an error; surfaces as an
    /// error only when a caller refuses to proceed (e.g. a resource loader).
    #[error("memory usage unsafe: {0}")]
    MemoryUnsafe(String),

    /// No pool slot became available within the acquire timeout.
    /// Retryable by the caller, typically once after forcing cleanup.
    #[error("resource pool exhausted: no slot became available within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// The pool is shutting down. Fatal to the current request.
    #[error("resource pool is unavailable (shutting down)")]
    PoolUnavailable,

    #[error("resource construction failed: {0}")]
    ResourceConstruction(String),

    /// Isolated per-unit analysis failure. Absorbed by the scan loop;
    /// the failing unit contributes an empty finding set.
    #[error("unit processing failed: {0}")]
    UnitProcessing(String),

    #[error("byte source error: {0}")]
    Source(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ScanError {
    /// Whether the caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScanError::PoolExhausted { .. })
    }
}
