//! Inference Engine Module
//!
//! Boundary to the NLP engines (opaque, possibly slow, possibly unreliable)
//! and the manager that pools them per engine kind.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{Result, ScanError};
use crate::memory::MemoryGuard;
use crate::pool::{PoolGuard, PoolHealth, ResourcePool};

/// One raw entity detection as returned by an inference engine.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Detection {
    pub label: String,
    pub text: String,
    pub score: f64,
    pub start: Option<usize>,
    pub end: Option<usize>,
}

/// The opaque inference call.
///
/// Implementations wrap whatever NER backend is configured. The call is
/// synchronous and may be slow; the pool's acquire timeout bounds only the
/// wait for a slot, never the call itself, so a slow analysis holds its
/// slot for the duration (an accepted source of pool exhaustion).
pub trait Analyzer: Send {
    fn analyze(&self, text: &str) -> Result<Vec<Detection>>;
}

/// Boxed analyzer as stored in pools.
pub type BoxedAnalyzer = Box<dyn Analyzer>;

/// Named pools of inference engines sharing one memory guard.
///
/// Pool exhaustion policy lives here, at the call site: a failed acquire
/// forces a cleanup pass and retries exactly once before surfacing the
/// saturation to the caller.
pub struct EngineManager {
    guard: Arc<MemoryGuard>,
    pools: HashMap<String, ResourcePool<BoxedAnalyzer>>,
}

impl EngineManager {
    pub fn new(guard: Arc<MemoryGuard>) -> Self {
        Self {
            guard,
            pools: HashMap::new(),
        }
    }

    /// Register a pool for an engine kind. Replaces any existing pool
    /// registered under the same kind.
    pub fn register_pool(&mut self, kind: impl Into<String>, pool: ResourcePool<BoxedAnalyzer>) {
        let kind = kind.into();
        info!(kind = %kind, "registered engine pool");
        self.pools.insert(kind, pool);
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Warm up every registered pool.
    pub async fn initialize_all(&self) -> Result<()> {
        for (kind, pool) in &self.pools {
            info!(kind = %kind, "initializing engine pool");
            pool.initialize().await?;
        }
        Ok(())
    }

    /// Acquire an engine of the given kind.
    ///
    /// On exhaustion, forces a memory cleanup and retries once; a second
    /// failure means the service is saturated and surfaces to the caller.
    pub async fn acquire(&self, kind: &str) -> Result<PoolGuard<BoxedAnalyzer>> {
        let pool = self
            .pools
            .get(kind)
            .ok_or_else(|| ScanError::Config(format!("unknown engine kind: {kind}")))?;

        match pool.acquire().await {
            Err(ScanError::PoolExhausted { waited_ms }) => {
                warn!(
                    kind = %kind,
                    waited_ms,
                    "engine pool exhausted; forcing cleanup and retrying once"
                );
                self.guard.cleanup();
                pool.acquire().await.map_err(|e| {
                    error!(kind = %kind, error = %e, "engine pool still saturated after retry");
                    e
                })
            }
            other => other,
        }
    }

    /// Per-kind pool health snapshots.
    pub fn health_check(&self) -> HashMap<String, PoolHealth> {
        self.pools
            .iter()
            .map(|(kind, pool)| (kind.clone(), pool.health_check()))
            .collect()
    }

    /// Shut down every pool, draining outstanding engines.
    pub async fn shutdown_all(&self) {
        for (kind, pool) in &self.pools {
            info!(kind = %kind, "shutting down engine pool");
            pool.shutdown().await;
        }
        self.guard.cleanup();
    }
}

impl std::fmt::Debug for EngineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineManager")
            .field("kinds", &self.pools.keys().collect::<Vec<_>>())
            .finish()
    }
}
