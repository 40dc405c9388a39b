//! Elapsed-time sampling
//!
//! [`ElapsedTimer::start`] captures a monotonic reading and returns a
//! [`Measure`] that can be sampled any number of times. Each sample is the
//! whole number of microseconds since the capture, truncated toward zero.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source, read as an offset from a fixed origin
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Process-wide monotonic clock backed by [`Instant`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        ORIGIN.get_or_init(Instant::now).elapsed()
    }
}

/// Hand-driven clock for deterministic tests. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Factory for [`Measure`]s over a given clock
#[derive(Debug, Clone, Default)]
pub struct ElapsedTimer<C = MonotonicClock> {
    clock: C,
}

impl ElapsedTimer<MonotonicClock> {
    pub fn new() -> Self {
        Self {
            clock: MonotonicClock,
        }
    }
}

impl<C: Clock + Clone> ElapsedTimer<C> {
    pub fn with_clock(clock: C) -> Self {
        Self { clock }
    }

    /// Capture the start reading.
    pub fn start(&self) -> Measure<C> {
        Measure {
            started: self.clock.now(),
            clock: self.clock.clone(),
        }
    }
}

/// A captured start point; sampling has no side effects beyond reading the clock.
#[derive(Debug, Clone)]
pub struct Measure<C = MonotonicClock> {
    clock: C,
    started: Duration,
}

impl<C: Clock> Measure<C> {
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.started)
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }
}

/// Start a measurement on the process-wide monotonic clock.
pub fn measure() -> Measure {
    ElapsedTimer::new().start()
}
