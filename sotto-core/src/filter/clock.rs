//! Pipeline clock abstraction.
//!
//! The catch-up policy compares frame presentation timestamps against the
//! pipeline's running time. Production uses a monotonic clock anchored at
//! filter construction; tests drive a manually advanced clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub trait PipelineClock: Send + Sync + 'static {
    /// Time elapsed since the start of the stream.
    fn running_time(&self) -> Duration;
}

/// Monotonic wall clock anchored at creation.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineClock for MonotonicClock {
    fn running_time(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now: Duration) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl PipelineClock for ManualClock {
    fn running_time(&self) -> Duration {
        *self.now.lock()
    }
}
