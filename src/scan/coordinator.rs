//! Streaming Scan Coordinator
//!
//! Consumes a byte stream in fixed-size units, checks memory pressure
//! between units, and runs the pooled inference engines over each unit.
//! Engines are acquired once per stream and released on every exit path,
//! including mid-stream abandonment of the session.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::config::ScanConfig;
use super::findings::{Finding, FindingSet};
use crate::engine::{BoxedAnalyzer, EngineManager};
use crate::error::Result;
use crate::memory::MemoryGuard;
use crate::pool::PoolGuard;

/// Async pull-based source of raw bytes, supplied by the ingestion layer.
#[async_trait]
pub trait ByteSource: Send {
    /// Pull the next chunk; `None` signals end of stream.
    async fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>>;
}

/// In-memory source, mainly for tests and small inputs.
#[async_trait]
impl ByteSource for VecDeque<Vec<u8>> {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.pop_front())
    }
}

/// Lifecycle of one scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Idle,
    Scanning,
    Completed,
    Failed,
}

/// Entry point for streaming scans. Holds the shared engine manager and
/// memory guard plus the engine kinds every unit is run through.
pub struct ScanCoordinator {
    manager: Arc<EngineManager>,
    guard: Arc<MemoryGuard>,
    engine_kinds: Vec<String>,
}

impl ScanCoordinator {
    pub fn new(
        manager: Arc<EngineManager>,
        guard: Arc<MemoryGuard>,
        engine_kinds: Vec<String>,
    ) -> Self {
        Self {
            manager,
            guard,
            engine_kinds,
        }
    }

    /// Start a scan over `source`, acquiring every configured engine once
    /// for the whole stream. Acquisition failures surface to the caller;
    /// engines already acquired are released on the way out.
    pub async fn scan<S: ByteSource>(&self, source: S, config: ScanConfig) -> Result<ScanSession<S>> {
        config.validate()?;

        let mut engines = Vec::with_capacity(self.engine_kinds.len());
        for kind in &self.engine_kinds {
            match self.manager.acquire(kind).await {
                Ok(engine) => engines.push((kind.clone(), engine)),
                Err(e) => {
                    error!(kind = %kind, error = %e, "could not acquire scan engine");
                    return Err(e);
                }
            }
        }

        debug!(engines = engines.len(), "scan session ready");
        Ok(ScanSession {
            source,
            engines,
            config,
            guard: Arc::clone(&self.guard),
            buffer: Vec::new(),
            state: ScanState::Idle,
            unit_index: 0,
            source_done: false,
        })
    }
}

/// One in-flight scan: a lazy, ordered sequence of finding sets.
///
/// Dropping the session releases its engines back to their pools.
pub struct ScanSession<S> {
    source: S,
    engines: Vec<(String, PoolGuard<BoxedAnalyzer>)>,
    config: ScanConfig,
    guard: Arc<MemoryGuard>,
    buffer: Vec<u8>,
    state: ScanState,
    unit_index: u64,
    source_done: bool,
}

impl<S> std::fmt::Debug for ScanSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSession")
            .field("engines", &self.engines.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("config", &self.config)
            .field("state", &self.state)
            .field("unit_index", &self.unit_index)
            .field("source_done", &self.source_done)
            .field("buffer_len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl<S: ByteSource> ScanSession<S> {
    /// Produce the finding set for the next unit, or `None` once the stream
    /// is exhausted.
    ///
    /// Bytes accumulate until a full unit of `chunk_size` is buffered; the
    /// remainder carries over, and a final partial unit is flushed at end
    /// of stream. Unsafe memory pressure delays a unit by one cleanup pass
    /// plus a fixed backoff but never drops it. A unit whose analysis fails
    /// contributes an empty set; only source errors end the session.
    pub async fn next_set(&mut self) -> Result<Option<FindingSet>> {
        match self.state {
            ScanState::Completed | ScanState::Failed => return Ok(None),
            ScanState::Idle => self.state = ScanState::Scanning,
            ScanState::Scanning => {}
        }

        while self.buffer.len() < self.config.chunk_size && !self.source_done {
            match self.source.next_chunk().await {
                Ok(Some(chunk)) => self.buffer.extend_from_slice(&chunk),
                Ok(None) => self.source_done = true,
                Err(e) => {
                    error!(unit = self.unit_index, error = %e, "byte source failed");
                    self.state = ScanState::Failed;
                    return Err(e.into());
                }
            }
        }

        let unit: Vec<u8> = if self.buffer.len() >= self.config.chunk_size {
            self.buffer.drain(..self.config.chunk_size).collect()
        } else if self.source_done && !self.buffer.is_empty() {
            std::mem::take(&mut self.buffer)
        } else {
            self.state = ScanState::Completed;
            info!(units = self.unit_index, "scan stream complete");
            return Ok(None);
        };

        // Degrade under pressure, never drop data: one cleanup pass and a
        // short pause, then the unit proceeds regardless.
        if !self.guard.check_safe() {
            warn!(
                unit = self.unit_index,
                "memory pressure unsafe; backing off before unit analysis"
            );
            self.guard.cleanup();
            tokio::time::sleep(self.config.pressure_backoff()).await;
        }

        let index = self.unit_index;
        self.unit_index += 1;
        Ok(Some(self.analyze_unit(&unit, index)))
    }

    /// Run every engine over one unit. Engine failures are isolated: they
    /// are recorded against the engine's pool slot and the remaining
    /// passes still contribute findings.
    fn analyze_unit(&self, unit: &[u8], index: u64) -> FindingSet {
        let text = String::from_utf8_lossy(unit);
        let mut findings: Vec<Finding> = Vec::new();

        for (kind, engine) in &self.engines {
            match engine.analyze(&text) {
                Ok(detections) => {
                    findings.extend(detections.into_iter().map(Finding::from));
                }
                Err(e) => {
                    engine.record_error();
                    warn!(
                        engine = %kind,
                        unit = index,
                        error = %e,
                        "unit analysis failed; continuing with remaining passes"
                    );
                }
            }
        }

        FindingSet::new(findings, index, unit.len())
    }

    /// Drive the session to completion, collecting every finding set.
    pub async fn collect(mut self) -> Result<Vec<FindingSet>> {
        let mut sets = Vec::new();
        while let Some(set) = self.next_set().await? {
            sets.push(set);
        }
        Ok(sets)
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn units_processed(&self) -> u64 {
        self.unit_index
    }
}
