//! Memory Circuit Breaker
//!
//! Once resident memory crosses the trip threshold the breaker refuses new
//! expensive work for a cooldown window, runs registered recovery callbacks,
//! and escalates to an aggressive cleanup pass after repeated trips.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Configuration for the memory circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Cooldown window after a trip, in milliseconds
    pub cooldown_ms: u64,
    /// Consecutive trips before escalating to aggressive cleanup
    pub max_consecutive_trips: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 60_000,
            max_consecutive_trips: 3,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Snapshot of breaker counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStats {
    pub tripped: bool,
    pub consecutive_trips: u32,
    pub trips_total: u64,
    pub aggressive_cleanups: u64,
}

#[derive(Debug, Default)]
struct BreakerState {
    tripped: bool,
    last_trip: Option<Instant>,
    consecutive_trips: u32,
    trips_total: u64,
    aggressive_cleanups: u64,
}

type BreakerCallback = Box<dyn Fn() + Send + Sync>;

/// Circuit breaker for memory protection.
///
/// State machine: Closed → (reading at/above the trip ratio) → Tripped →
/// (cooldown elapsed AND a fresh reading below the trip ratio) → Closed.
/// While tripped and inside the cooldown window every check fails closed
/// without re-reading memory, so a borderline reading cannot cause a
/// trip-recheck-trip oscillation.
pub struct CircuitBreaker {
    trip_ratio: f64,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    /// Named callbacks, run in registration order on every trip.
    callbacks: RwLock<Vec<(String, BreakerCallback)>>,
}

impl CircuitBreaker {
    /// Create a breaker that trips when the usage ratio reaches `trip_ratio`.
    pub fn new(trip_ratio: f64, config: BreakerConfig) -> Self {
        Self {
            trip_ratio,
            config,
            state: Mutex::new(BreakerState::default()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback to run when the breaker trips.
    ///
    /// Upsert by name: re-registering replaces the callback but keeps its
    /// original position in the run order.
    pub fn register_callback<F>(&self, name: &str, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.write();
        if let Some(entry) = callbacks.iter_mut().find(|(n, _)| n == name) {
            entry.1 = Box::new(callback);
        } else {
            callbacks.push((name.to_string(), Box::new(callback)));
        }
    }

    /// Check whether it is safe to proceed with expensive work.
    ///
    /// During cooldown this returns `false` without invoking `read_ratio`.
    /// Outside cooldown one fresh reading decides: at/above the trip ratio
    /// (or a failed reading) re-trips and extends the cooldown; below it
    /// closes the breaker and resets the consecutive-trip counter.
    pub fn check<F>(&self, read_ratio: F) -> bool
    where
        F: FnOnce() -> Option<f64>,
    {
        {
            let state = self.state.lock();
            if state.tripped {
                if let Some(last) = state.last_trip {
                    if last.elapsed() < self.config.cooldown() {
                        debug!("circuit breaker in cooldown; refusing work");
                        return false;
                    }
                }
            }
        }

        match read_ratio() {
            Some(ratio) if ratio < self.trip_ratio => {
                let mut state = self.state.lock();
                if state.tripped {
                    info!(usage_ratio = ratio, "memory recovered; closing circuit breaker");
                }
                state.tripped = false;
                state.consecutive_trips = 0;
                true
            }
            // Still at/above the trip ratio, or the reading failed (fail closed).
            _ => {
                self.trip();
                false
            }
        }
    }

    /// Trip the breaker: record the trip, run callbacks, escalate if needed.
    pub fn trip(&self) {
        let escalate = {
            let mut state = self.state.lock();
            state.tripped = true;
            state.last_trip = Some(Instant::now());
            state.consecutive_trips += 1;
            state.trips_total += 1;
            warn!(
                consecutive_trips = state.consecutive_trips,
                "memory circuit breaker tripped"
            );
            state.consecutive_trips >= self.config.max_consecutive_trips
        };

        // Callbacks run outside the state lock; a failing callback must not
        // prevent the remaining callbacks or the trip from completing.
        let callbacks = self.callbacks.read();
        for (name, callback) in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!(callback = %name, "circuit breaker callback panicked");
            }
        }
        drop(callbacks);

        if escalate {
            self.aggressive_cleanup();
        }
    }

    /// Aggressive reclamation pass, distinct from ordinary cleanup: after
    /// trip callbacks have evicted what they can, ask the native allocator
    /// to return freed pages to the system.
    fn aggressive_cleanup(&self) {
        error!("maximum consecutive trips reached; forcing aggressive cleanup");
        super::trim_native_allocator();
        self.state.lock().aggressive_cleanups += 1;
    }

    /// Whether the breaker is currently tripped.
    pub fn is_tripped(&self) -> bool {
        self.state.lock().tripped
    }

    /// Counter snapshot for observability.
    pub fn stats(&self) -> BreakerStats {
        let state = self.state.lock();
        BreakerStats {
            tripped: state.tripped,
            consecutive_trips: state.consecutive_trips,
            trips_total: state.trips_total,
            aggressive_cleanups: state.aggressive_cleanups,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("trip_ratio", &self.trip_ratio)
            .field("tripped", &state.tripped)
            .field("consecutive_trips", &state.consecutive_trips)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_reader(reads: Arc<AtomicUsize>, ratio: f64) -> impl FnOnce() -> Option<f64> {
        move || {
            reads.fetch_add(1, Ordering::SeqCst);
            Some(ratio)
        }
    }

    #[test]
    fn test_safe_below_threshold() {
        let breaker = CircuitBreaker::new(0.9, BreakerConfig::default());
        assert!(breaker.check(|| Some(0.5)));
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn test_trips_at_threshold() {
        let breaker = CircuitBreaker::new(0.9, BreakerConfig::default());
        // Boundary reading classifies as unsafe
        assert!(!breaker.check(|| Some(0.9)));
        assert!(breaker.is_tripped());
    }

    #[test]
    fn test_cooldown_never_rereads() {
        let breaker = CircuitBreaker::new(0.9, BreakerConfig::default());
        let reads = Arc::new(AtomicUsize::new(0));

        assert!(!breaker.check(counting_reader(reads.clone(), 0.95)));
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        // Repeated checks during cooldown: always false, no reads.
        for _ in 0..5 {
            assert!(!breaker.check(counting_reader(reads.clone(), 0.1)));
        }
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rereads_exactly_once_after_cooldown() {
        let config = BreakerConfig {
            cooldown_ms: 20,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(0.9, config);
        let reads = Arc::new(AtomicUsize::new(0));

        assert!(!breaker.check(counting_reader(reads.clone(), 0.95)));
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        std::thread::sleep(Duration::from_millis(30));

        // First post-cooldown check re-reads exactly once and closes.
        assert!(breaker.check(counting_reader(reads.clone(), 0.5)));
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.stats().consecutive_trips, 0);
    }

    #[test]
    fn test_retrip_extends_cooldown() {
        let config = BreakerConfig {
            cooldown_ms: 20,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(0.9, config);

        assert!(!breaker.check(|| Some(0.95)));
        std::thread::sleep(Duration::from_millis(30));
        // Still above threshold: re-trip, counter grows.
        assert!(!breaker.check(|| Some(0.95)));
        assert_eq!(breaker.stats().consecutive_trips, 2);
        assert!(breaker.is_tripped());
    }

    #[test]
    fn test_failed_reading_fails_closed() {
        let breaker = CircuitBreaker::new(0.9, BreakerConfig::default());
        assert!(!breaker.check(|| None));
        assert!(breaker.is_tripped());
    }

    #[test]
    fn test_escalation_exactly_once_at_max_trips() {
        let breaker = CircuitBreaker::new(0.9, BreakerConfig::default());
        for _ in 0..3 {
            breaker.trip();
        }
        assert_eq!(breaker.stats().aggressive_cleanups, 1);
        assert_eq!(breaker.stats().consecutive_trips, 3);
    }

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let breaker = CircuitBreaker::new(0.9, BreakerConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = order.clone();
            breaker.register_callback(name, move || order.lock().push(name));
        }
        breaker.trip();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_callback_upsert_keeps_position() {
        let breaker = CircuitBreaker::new(0.9, BreakerConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b"] {
            let order = order.clone();
            breaker.register_callback(name, move || order.lock().push(name.to_string()));
        }
        // Replace "a": still runs first.
        let order_clone = order.clone();
        breaker.register_callback("a", move || order_clone.lock().push("a2".to_string()));
        breaker.trip();
        assert_eq!(*order.lock(), vec!["a2".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let breaker = CircuitBreaker::new(0.9, BreakerConfig::default());
        let ran = Arc::new(AtomicUsize::new(0));

        breaker.register_callback("bad", || panic!("callback failure"));
        let ran_clone = ran.clone();
        breaker.register_callback("good", move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });

        breaker.trip();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(breaker.is_tripped());
    }
}
