use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Source of time for the endpoint.
///
/// The only time-based mechanism in the transport is RNR backoff, which
/// works on a monotonic microsecond clock. Abstracting the clock lets
/// tests drive backoff expiry deterministically.
pub trait TimeProvider: Send + Sync + Debug {
    fn now_instant(&self) -> Instant;
    /// Monotonic microseconds since an arbitrary origin.
    fn now_micros(&self) -> u64;
}

#[derive(Debug)]
pub struct SystemTimeProvider {
    origin: Instant,
}

impl SystemTimeProvider {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// A manual time provider for deterministic simulations.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    micros: RwLock<u64>,
}

impl ManualTimeProvider {
    pub fn new() -> Self {
        Self {
            instant: RwLock::new(Instant::now()),
            micros: RwLock::new(0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
        *self.micros.write().unwrap() += duration.as_micros() as u64;
    }

    pub fn advance_micros(&self, micros: u64) {
        *self.instant.write().unwrap() += Duration::from_micros(micros);
        *self.micros.write().unwrap() += micros;
    }
}

impl Default for ManualTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_micros(&self) -> u64 {
        *self.micros.read().unwrap()
    }
}
