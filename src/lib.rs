//! PII Scanner Core
//!
//! Memory-bounded concurrent resource pooling for a file-upload PII
//! scanning service:
//! - Process-wide memory guard with circuit-breaker protection
//! - Bounded pools of expensive, lazily-constructed inference engines
//! - Streaming scan coordination with chunked ingestion and backpressure
//!
//! # Modules
//!
//! ## Core
//! - [`memory`] - Memory guard, pressure bands, circuit breaker
//! - [`pool`] - Bounded resource pooling with RAII release and self-healing
//! - [`engine`] - Inference engine boundary and per-kind pool management
//! - [`scan`] - Streaming scan sessions, findings, result aggregation
//!
//! ## Services
//! - [`health`] - Combined liveness snapshot for external probes
//!
//! The HTTP layer, file-format readers, the NLP engines themselves, and
//! result storage are external collaborators: bytes come in through
//! [`scan::ByteSource`], inference happens behind [`engine::Analyzer`],
//! and [`scan::ScanReport`] / [`health::HealthSnapshot`] serialize for
//! whatever transport sits above.

// Core error handling
pub mod error;

// Core subsystems
pub mod engine;
pub mod memory;
pub mod pool;
pub mod scan;

// Services
pub mod health;

pub use error::{Result, ScanError};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{Result, ScanError};

    // Memory guarding
    pub use crate::memory::{
        BreakerConfig, CircuitBreaker, MemoryGuard, MemoryProbe, MemoryThresholds, PressureLevel,
    };

    // Resource pooling
    pub use crate::pool::{PoolConfig, PoolGuard, PoolHealth, ResourcePool};

    // Inference engines
    pub use crate::engine::{Analyzer, BoxedAnalyzer, Detection, EngineManager};

    // Scanning
    pub use crate::scan::{
        ByteSource, Finding, FindingSet, ScanConfig, ScanCoordinator, ScanReport, ScanSession,
        ScanState,
    };

    // Health surface
    pub use crate::health::HealthSnapshot;
}
