//! Process Memory Guard
//!
//! Tracks resident memory against a configured ceiling, classifies pressure
//! into bands, and coordinates cleanup with the circuit breaker. One guard
//! instance is created at process start and shared (`Arc`) by every caller
//! that performs memory-sensitive work.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use sysinfo::{Pid, System};
use tracing::{debug, error, info, warn};

use super::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{Result, ScanError};

/// Memory thresholds as fractions of the byte ceiling.
///
/// Invariant: `0 < warning < critical < breaker_trip < 1`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryThresholds {
    pub warning: f64,
    pub critical: f64,
    pub breaker_trip: f64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning: 0.75,
            critical: 0.85,
            breaker_trip: 0.90,
        }
    }
}

impl MemoryThresholds {
    /// Create validated thresholds.
    pub fn new(warning: f64, critical: f64, breaker_trip: f64) -> Result<Self> {
        let thresholds = Self {
            warning,
            critical,
            breaker_trip,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    fn validate(&self) -> Result<()> {
        let ordered = 0.0 < self.warning
            && self.warning < self.critical
            && self.critical < self.breaker_trip
            && self.breaker_trip < 1.0;
        if ordered {
            Ok(())
        } else {
            Err(ScanError::Config(format!(
                "memory thresholds must satisfy 0 < warning < critical < breaker_trip < 1, \
                 got {} / {} / {}",
                self.warning, self.critical, self.breaker_trip
            )))
        }
    }

    /// Classify a usage ratio into a pressure band.
    ///
    /// Boundary values classify into the more severe band: a ratio exactly
    /// at `critical` is `Critical`, not `Warning`.
    pub fn classify(&self, ratio: f64) -> PressureLevel {
        if ratio >= self.breaker_trip {
            PressureLevel::Breaker
        } else if ratio >= self.critical {
            PressureLevel::Critical
        } else if ratio >= self.warning {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

/// Current memory pressure band, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
    Breaker,
}

/// Seam for reading the process's resident memory.
///
/// `None` means the reading failed; callers treat that as critical pressure
/// rather than assuming safety.
pub trait MemoryProbe: Send + Sync {
    fn usage_bytes(&self) -> Option<u64>;
}

/// Production probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            pid: Pid::from_u32(std::process::id()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn usage_bytes(&self) -> Option<u64> {
        let mut system = self.system.lock();
        system.refresh_all();
        system.process(self.pid).map(|p| p.memory())
    }
}

type CleanupHook = Box<dyn Fn() + Send + Sync>;

/// Process-wide memory guard with circuit-breaker protection.
pub struct MemoryGuard {
    ceiling_bytes: AtomicU64,
    thresholds: MemoryThresholds,
    probe: Arc<dyn MemoryProbe>,
    breaker: CircuitBreaker,
    /// Named reclamation hooks (cache eviction etc.), run in registration order.
    cleanup_hooks: Mutex<Vec<(String, CleanupHook)>>,
}

impl MemoryGuard {
    /// Create a guard reading memory through `sysinfo`.
    pub fn new(
        ceiling_bytes: u64,
        thresholds: MemoryThresholds,
        breaker_config: BreakerConfig,
    ) -> Arc<Self> {
        Self::with_probe(
            ceiling_bytes,
            thresholds,
            breaker_config,
            Arc::new(SysinfoProbe::new()),
        )
    }

    /// Create a guard with a custom memory probe.
    pub fn with_probe(
        ceiling_bytes: u64,
        thresholds: MemoryThresholds,
        breaker_config: BreakerConfig,
        probe: Arc<dyn MemoryProbe>,
    ) -> Arc<Self> {
        let guard = Arc::new(Self {
            ceiling_bytes: AtomicU64::new(ceiling_bytes.max(1)),
            thresholds,
            probe,
            breaker: CircuitBreaker::new(thresholds.breaker_trip, breaker_config),
            cleanup_hooks: Mutex::new(Vec::new()),
        });
        guard.wire_breaker_callbacks();
        guard
    }

    /// Wire the guard's own recovery actions into its breaker, mirroring the
    /// cleanup and usage-logging callbacks every trip should run.
    fn wire_breaker_callbacks(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.breaker.register_callback("cleanup", move || {
            if let Some(guard) = weak.upgrade() {
                guard.cleanup();
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        self.breaker.register_callback("log_memory", move || {
            if let Some(guard) = weak.upgrade() {
                warn!(
                    usage_mb = guard.current_usage() / (1024 * 1024),
                    "memory usage at trip"
                );
            }
        });
    }

    /// Current resident memory in bytes; 0 if the probe fails.
    pub fn current_usage(&self) -> u64 {
        self.probe.usage_bytes().unwrap_or(0)
    }

    /// Current usage as a fraction of the ceiling; `None` if the probe fails.
    pub fn usage_ratio(&self) -> Option<f64> {
        let ceiling = self.ceiling_bytes.load(Ordering::Relaxed).max(1);
        self.probe
            .usage_bytes()
            .map(|usage| usage as f64 / ceiling as f64)
    }

    fn pressure_and_safety(&self) -> (PressureLevel, bool) {
        let ratio = self.usage_ratio();
        let level = match ratio {
            Some(r) => self.thresholds.classify(r),
            None => {
                warn!("memory probe read failed; assuming critical pressure");
                PressureLevel::Critical
            }
        };

        match level {
            PressureLevel::Normal => (level, true),
            PressureLevel::Warning => {
                warn!(usage_ratio = ?ratio, "memory usage elevated");
                (level, true)
            }
            PressureLevel::Critical => {
                error!(usage_ratio = ?ratio, "memory usage high; running cleanup");
                self.cleanup();
                (level, true)
            }
            PressureLevel::Breaker => {
                error!(usage_ratio = ?ratio, "memory usage at breaker threshold");
                let probe = Arc::clone(&self.probe);
                let ceiling = self.ceiling_bytes.load(Ordering::Relaxed).max(1);
                let safe = self.breaker.check(move || {
                    probe
                        .usage_bytes()
                        .map(|usage| usage as f64 / ceiling as f64)
                });
                (level, safe)
            }
        }
    }

    /// Classify current pressure, applying each band's side effects:
    /// `Warning` logs, `Critical` runs a synchronous cleanup pass, `Breaker`
    /// consults (and may trip) the circuit breaker. Never fails; a probe
    /// error classifies as `Critical`.
    pub fn check_pressure(&self) -> PressureLevel {
        self.pressure_and_safety().0
    }

    /// Whether it is safe to begin expensive work right now.
    ///
    /// `false` only at breaker-level pressure when the circuit breaker
    /// refuses (freshly tripped or still in cooldown).
    pub fn check_safe(&self) -> bool {
        self.pressure_and_safety().1
    }

    /// Best-effort memory reclamation: run registered hooks, then request a
    /// native allocator trim. Never fails; hook errors are logged and
    /// swallowed.
    pub fn cleanup(&self) {
        debug!("running memory cleanup pass");
        let hooks = self.cleanup_hooks.lock();
        for (name, hook) in hooks.iter() {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                error!(hook = %name, "cleanup hook panicked");
            }
        }
        drop(hooks);
        super::trim_native_allocator();
    }

    /// Register a reclamation hook (idempotent upsert by name).
    pub fn register_cleanup_hook<F>(&self, name: &str, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut hooks = self.cleanup_hooks.lock();
        if let Some(entry) = hooks.iter_mut().find(|(n, _)| n == name) {
            entry.1 = Box::new(hook);
        } else {
            hooks.push((name.to_string(), Box::new(hook)));
        }
    }

    /// Change the byte ceiling; takes effect on the next check.
    pub fn set_ceiling(&self, ceiling_bytes: u64) {
        if ceiling_bytes == 0 {
            warn!("ignoring zero memory ceiling");
            return;
        }
        info!(ceiling_bytes, "memory ceiling updated");
        self.ceiling_bytes.store(ceiling_bytes, Ordering::Relaxed);
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling_bytes.load(Ordering::Relaxed)
    }

    pub fn thresholds(&self) -> &MemoryThresholds {
        &self.thresholds
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl std::fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("ceiling_bytes", &self.ceiling())
            .field("thresholds", &self.thresholds)
            .field("breaker", &self.breaker)
            .finish()
    }
}
