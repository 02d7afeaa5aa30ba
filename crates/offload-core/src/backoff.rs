use std::time::{Duration, SystemTime};

/// Exponential backoff with a small jitter, shared by every retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    /// Attempts past this exponent stop doubling the delay.
    pub max_exponent: u32,
    pub max_jitter: Duration,
}

impl Backoff {
    pub const fn new(base: Duration, max_exponent: u32, max_jitter: Duration) -> Self {
        Self {
            base,
            max_exponent,
            max_jitter,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.base * 2u32.pow(attempt.min(self.max_exponent))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + jitter(self.max_jitter)
    }

    pub async fn sleep(&self, attempt: u32) {
        tokio::time::sleep(self.delay(attempt)).await;
    }
}

/// Random-ish value below `max` using timestamp nanos.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(nanos % max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let backoff = Backoff::new(Duration::from_millis(20), 3, Duration::from_millis(5));
        assert_eq!(backoff.base_delay(0), Duration::from_millis(20));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(80));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(160));
        assert_eq!(backoff.base_delay(9), Duration::from_millis(160));

        let delay = backoff.delay(1);
        assert!(delay >= Duration::from_millis(40) && delay < Duration::from_millis(45));
    }

    #[test]
    fn test_zero_jitter() {
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
        assert!(jitter(Duration::from_millis(100)) < Duration::from_millis(100));
    }
}
