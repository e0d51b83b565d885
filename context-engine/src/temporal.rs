//! Time source and forgetting-curve helpers
//!
//! Every timestamp the engine records comes from an injected [`Clock`], so
//! TTL expiry and recency decay can be driven deterministically in tests.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of "now" for the engine
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to a specific instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Elapsed hours between two instants, clamped at zero
pub fn hours_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    let millis = (later - earlier).num_milliseconds().max(0);
    millis as f64 / 3_600_000.0
}

/// Memory stability in hours after `access_count` reinforcements.
///
/// Each access stretches the half-life logarithmically, so repeated recall
/// slows forgetting without letting a single hot node become immortal.
pub fn stability_hours(half_life_hours: f64, reinforcement: f64, access_count: u64) -> f64 {
    half_life_hours * (1.0 + reinforcement * (1.0 + access_count as f64).ln())
}

/// Exponential retention `2^(-elapsed / stability)`, in `[0, 1]`
pub fn retention(elapsed_hours: f64, stability_hours: f64) -> f64 {
    if stability_hours <= 0.0 {
        return 0.0;
    }
    (-elapsed_hours / stability_hours).exp2()
}
