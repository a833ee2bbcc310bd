//! Wall-clock sources
//!
//! Scheduling works in UTC while timers run on tokio's monotonic clock. [`MonotonicClock`]
//! derives UTC from tokio time, so it follows paused test time.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// UTC anchored once, then advanced by tokio's clock
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin_utc: DateTime<Utc>,
    origin: Instant,
}

impl MonotonicClock {
    pub fn starting_at(origin_utc: DateTime<Utc>) -> Self {
        Self {
            origin_utc,
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_utc + elapsed
    }
}

/// Time from now until `target`, zero if it has passed
pub fn until(clock: &dyn Clock, target: DateTime<Utc>) -> Duration {
    (target - clock.now()).to_std().unwrap_or(Duration::ZERO)
}

/// Tokio instant corresponding to a UTC time on `clock`
pub fn instant_at(clock: &dyn Clock, target: DateTime<Utc>) -> Instant {
    let now = Instant::now();
    let delta = target - clock.now();
    match delta.to_std() {
        Ok(ahead) => now + ahead,
        Err(_) => {
            let behind = (-delta).to_std().unwrap_or(Duration::ZERO);
            now.checked_sub(behind).unwrap_or(now)
        }
    }
}
