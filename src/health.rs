//! Liveness and readiness surface
//!
//! Combines the memory guard's current state with every engine pool's
//! health into one serializable snapshot for an external probe. The
//! service reports unhealthy while the circuit breaker is tripped.

use serde::Serialize;
use std::collections::HashMap;

use crate::engine::EngineManager;
use crate::memory::{MemoryGuard, PressureLevel};
use crate::pool::PoolHealth;

/// Memory-side health
#[derive(Debug, Clone, Serialize)]
pub struct MemoryHealth {
    pub usage_bytes: u64,
    pub ceiling_bytes: u64,
    pub usage_ratio: f64,
    pub pressure: PressureLevel,
    pub breaker_tripped: bool,
}

/// Combined snapshot for liveness probes
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub memory: MemoryHealth,
    pub pools: HashMap<String, PoolHealth>,
}

impl HealthSnapshot {
    /// Collect a point-in-time snapshot. Read-only: classification here
    /// does not trigger cleanup or breaker transitions.
    pub fn collect(guard: &MemoryGuard, manager: &EngineManager) -> Self {
        let usage_bytes = guard.current_usage();
        let ceiling_bytes = guard.ceiling();
        let usage_ratio = usage_bytes as f64 / ceiling_bytes.max(1) as f64;
        let breaker_tripped = guard.breaker().is_tripped();

        Self {
            healthy: !breaker_tripped,
            memory: MemoryHealth {
                usage_bytes,
                ceiling_bytes,
                usage_ratio,
                pressure: guard.thresholds().classify(usage_ratio),
                breaker_tripped,
            },
            pools: manager.health_check(),
        }
    }
}
