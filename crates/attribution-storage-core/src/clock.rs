use std::sync::Arc;

use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};

use crate::timestamps::{now_utc, truncate_to_micros};

/// Source of "now" for every time-dependent decision in storage.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Manually advanced clock; clones share the same instant.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl SimulatedClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(truncate_to_micros(start))),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now = truncate_to_micros(*now + delta);
    }

    pub fn set(&self, value: OffsetDateTime) {
        *self.now.lock() = truncate_to_micros(value);
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH + Duration::days(20_000))
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_time() {
        let clock = SimulatedClock::default();
        let observer = clock.clone();
        let start = observer.now();
        clock.advance(Duration::milliseconds(3));
        assert_eq!(observer.now() - start, Duration::milliseconds(3));
    }
}
