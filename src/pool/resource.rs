//! Bounded Resource Pool
//!
//! A generic pool for expensive, slow-to-construct, reusable resources
//! (inference engines). Slots are populated lazily under memory-guard
//! gating, lent out through RAII guards whose release is guaranteed on
//! every exit path, and replaced in place when they accumulate errors.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ScanError};
use crate::memory::MemoryGuard;

/// Failures attributed to a slot before its resource is rebuilt at release.
const ERROR_RESET_THRESHOLD: u32 = 3;

/// Poll interval while draining outstanding slots during shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Configuration for a resource pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of pooled resources
    pub max_size: usize,
    /// How long `acquire` waits for a free slot, in milliseconds
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 2,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Per-slot health entry
#[derive(Debug, Clone, Serialize)]
pub struct SlotHealth {
    pub id: usize,
    pub in_use: bool,
    pub load_count: u64,
    pub error_count: u32,
}

/// Read-only pool snapshot for observability
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub size: usize,
    pub available: usize,
    pub initialized: bool,
    pub shutting_down: bool,
    pub slots: Vec<SlotHealth>,
}

/// One slot in the pool. `value` is taken while the resource is lent out.
struct PooledResource<T> {
    value: Option<T>,
    in_use: bool,
    load_count: u64,
    error_count: u32,
}

impl<T> PooledResource<T> {
    fn new(value: T) -> Self {
        Self {
            value: Some(value),
            in_use: false,
            load_count: 0,
            error_count: 0,
        }
    }
}

type Loader<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;
type Teardown<T> = Box<dyn Fn(T) + Send + Sync>;

struct PoolInner<T> {
    config: PoolConfig,
    guard: Arc<MemoryGuard>,
    loader: Loader<T>,
    teardown: Option<Teardown<T>>,
    slots: Mutex<HashMap<usize, PooledResource<T>>>,
    available_tx: mpsc::Sender<usize>,
    available_rx: tokio::sync::Mutex<mpsc::Receiver<usize>>,
    available_count: AtomicUsize,
    initialized: AtomicBool,
    shutting_down: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

/// Bounded pool of lazily-constructed resources.
///
/// Cloning shares the same underlying pool.
pub struct ResourcePool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    /// Create a pool whose resources are built by `loader` and torn down by
    /// dropping them.
    pub fn new<F>(config: PoolConfig, guard: Arc<MemoryGuard>, loader: F) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        Self::build(config, guard, Box::new(loader), None)
    }

    /// Create a pool with an explicit teardown hook, for resources whose
    /// backing library wants a release call.
    pub fn new_with_teardown<F, D>(
        config: PoolConfig,
        guard: Arc<MemoryGuard>,
        loader: F,
        teardown: D,
    ) -> Self
    where
        F: Fn() -> Result<T> + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        Self::build(config, guard, Box::new(loader), Some(Box::new(teardown)))
    }

    fn build(
        config: PoolConfig,
        guard: Arc<MemoryGuard>,
        loader: Loader<T>,
        teardown: Option<Teardown<T>>,
    ) -> Self {
        let capacity = config.max_size.max(1);
        let (available_tx, available_rx) = mpsc::channel(capacity);
        Self {
            inner: Arc::new(PoolInner {
                config,
                guard,
                loader,
                teardown,
                slots: Mutex::new(HashMap::new()),
                available_tx,
                available_rx: tokio::sync::Mutex::new(available_rx),
                available_count: AtomicUsize::new(0),
                initialized: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                init_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Populate the pool, constructing up to `max_size` resources.
    ///
    /// Idempotent and safe to call concurrently; only one initialization
    /// sequence runs. Each construction is gated by the memory guard:
    /// the first unsafe reading stops warm-up early and the pool runs
    /// under-provisioned rather than failing outright.
    pub async fn initialize(&self) -> Result<()> {
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let _init = self.inner.init_lock.lock().await;
        if self.inner.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(ScanError::PoolUnavailable);
        }

        let mut built = 0;
        for id in 0..self.inner.config.max_size {
            if !self.inner.guard.check_safe() {
                warn!(
                    built,
                    requested = self.inner.config.max_size,
                    "memory pressure halted pool warm-up"
                );
                break;
            }
            match (self.inner.loader)() {
                Ok(value) => {
                    self.inner.slots.lock().insert(id, PooledResource::new(value));
                    // Capacity equals max_size, so this send cannot fail.
                    if self.inner.available_tx.try_send(id).is_ok() {
                        self.inner.available_count.fetch_add(1, Ordering::AcqRel);
                    }
                    built += 1;
                }
                Err(e) => {
                    error!(slot = id, error = %e, "resource construction failed");
                    break;
                }
            }
        }

        self.inner.initialized.store(true, Ordering::Release);
        info!(size = built, "resource pool initialized");
        Ok(())
    }

    /// Acquire a resource, waiting up to the configured timeout for a slot.
    ///
    /// Initializes the pool on first use. Fails with `PoolUnavailable` once
    /// shutdown has begun and `PoolExhausted` when no slot frees up in time.
    pub async fn acquire(&self) -> Result<PoolGuard<T>> {
        if !self.inner.initialized.load(Ordering::Acquire) {
            self.initialize().await?;
        }
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(ScanError::PoolUnavailable);
        }

        let wait = self.inner.config.acquire_timeout();
        let received = timeout(wait, async {
            let mut rx = self.inner.available_rx.lock().await;
            rx.recv().await
        })
        .await;

        let id = match received {
            Ok(Some(id)) => id,
            Ok(None) => return Err(ScanError::PoolUnavailable),
            Err(_) => {
                return Err(ScanError::PoolExhausted {
                    waited_ms: self.inner.config.acquire_timeout_ms,
                })
            }
        };
        self.inner.available_count.fetch_sub(1, Ordering::AcqRel);

        let value = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&id) {
                Some(slot) => {
                    slot.in_use = true;
                    slot.load_count += 1;
                    slot.value.take()
                }
                None => None,
            }
        };

        match value {
            Some(value) => {
                debug!(slot = id, "resource acquired");
                Ok(PoolGuard {
                    inner: Arc::clone(&self.inner),
                    id,
                    value: Some(value),
                })
            }
            // The registry was cleared by a concurrent shutdown.
            None => Err(ScanError::PoolUnavailable),
        }
    }

    /// Begin shutdown: refuse new acquisitions, wait up to the acquire
    /// timeout for outstanding slots, then tear down every resource.
    ///
    /// A holder that never releases cannot block shutdown indefinitely;
    /// after the wait the registry is cleared anyway with a warning.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);

        let deadline = tokio::time::Instant::now() + self.inner.config.acquire_timeout();
        loop {
            let outstanding = {
                let slots = self.inner.slots.lock();
                slots.values().filter(|slot| slot.in_use).count()
            };
            if outstanding == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(outstanding, "timed out waiting for resources during shutdown");
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        let drained: Vec<PooledResource<T>> = {
            let mut slots = self.inner.slots.lock();
            let mut entries: Vec<(usize, PooledResource<T>)> = slots.drain().collect();
            entries.sort_by_key(|(id, _)| *id);
            entries.into_iter().map(|(_, slot)| slot).collect()
        };
        let count = drained.len();
        for slot in drained {
            if let Some(value) = slot.value {
                if let Some(teardown) = &self.inner.teardown {
                    teardown(value);
                }
            }
        }
        self.inner.initialized.store(false, Ordering::Release);
        info!(size = count, "resource pool shut down");
    }

    /// Read-only snapshot of pool state.
    pub fn health_check(&self) -> PoolHealth {
        let slots = self.inner.slots.lock();
        let mut entries: Vec<SlotHealth> = slots
            .iter()
            .map(|(id, slot)| SlotHealth {
                id: *id,
                in_use: slot.in_use,
                load_count: slot.load_count,
                error_count: slot.error_count,
            })
            .collect();
        entries.sort_by_key(|slot| slot.id);
        PoolHealth {
            size: slots.len(),
            available: self.inner.available_count.load(Ordering::Acquire),
            initialized: self.inner.initialized.load(Ordering::Acquire),
            shutting_down: self.inner.shutting_down.load(Ordering::Acquire),
            slots: entries,
        }
    }

    /// Current number of populated slots.
    pub fn size(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Currently queued (free) slots.
    pub fn available(&self) -> usize {
        self.inner.available_count.load(Ordering::Acquire)
    }
}

/// Scoped handle to a pooled resource.
///
/// Dropping the guard releases the slot on every exit path, including task
/// abandonment at an await point. If the slot has accumulated more than the
/// error ceiling, release first attempts to rebuild the resource (gated by
/// the memory guard) before returning the slot to service; a failed rebuild
/// keeps the degraded resource. The rebuild runs synchronously in `drop`,
/// so a slow loader blocks the releasing task for its duration.
pub struct PoolGuard<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
    id: usize,
    value: Option<T>,
}

impl<T: Send + 'static> PoolGuard<T> {
    /// Attribute a failure to this resource instance. Slots exceeding the
    /// error ceiling are rebuilt when the guard is released.
    pub fn record_error(&self) {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get_mut(&self.id) {
            slot.error_count += 1;
            warn!(
                slot = self.id,
                error_count = slot.error_count,
                "error recorded against pooled resource"
            );
        }
    }

    pub fn slot_id(&self) -> usize {
        self.id
    }
}

impl<T: Send + 'static> std::ops::Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("resource already released")
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("resource already released")
    }
}

impl<T: Send + 'static> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        let mut value = self.value.take();

        // Error-driven self-healing: rebuild a suspect resource before the
        // slot re-enters service. Runs outside the registry lock because
        // the loader may take seconds.
        let error_count = {
            let slots = self.inner.slots.lock();
            slots.get(&self.id).map(|slot| slot.error_count)
        };
        if let Some(errors) = error_count {
            if errors > ERROR_RESET_THRESHOLD && self.inner.guard.check_safe() {
                match (self.inner.loader)() {
                    Ok(fresh) => {
                        info!(slot = self.id, errors, "rebuilt degraded resource");
                        if let Some(old) = value.replace(fresh) {
                            if let Some(teardown) = &self.inner.teardown {
                                teardown(old);
                            }
                        }
                        let mut slots = self.inner.slots.lock();
                        if let Some(slot) = slots.get_mut(&self.id) {
                            slot.error_count = 0;
                        }
                    }
                    Err(e) => {
                        // Keep serving the degraded instance; the next
                        // release will try again.
                        error!(slot = self.id, error = %e, "resource rebuild failed; keeping degraded instance");
                    }
                }
            }
        }

        let returned = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&self.id) {
                Some(slot) => {
                    slot.in_use = false;
                    slot.value = value.take();
                    true
                }
                None => false,
            }
        };

        if returned {
            if self.inner.available_tx.try_send(self.id).is_ok() {
                self.inner.available_count.fetch_add(1, Ordering::AcqRel);
            }
        } else if let Some(orphan) = value {
            // Registry already cleared by shutdown; tear the value down here.
            if let Some(teardown) = &self.inner.teardown {
                teardown(orphan);
            }
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for PoolGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("slot", &self.id)
            .field("held", &self.value.is_some())
            .finish()
    }
}
