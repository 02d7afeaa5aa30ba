use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Wall-clock source used for locks, control timestamps and version prefixes.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Seconds since the Unix epoch.
    fn epoch_secs(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    pub fn new(start_secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(start_secs),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.secs.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, secs: i64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.secs.load(Ordering::SeqCst), 0).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.epoch_secs(), 100);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.epoch_secs(), 160);
        clock.set(5);
        assert_eq!(clock.epoch_secs(), 5);
    }
}
