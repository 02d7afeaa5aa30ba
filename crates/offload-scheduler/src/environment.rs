use std::time::Duration;

use tracing::debug;

/// Limits of the invocation a slice runs in.
pub trait ExecutionEnvironment: Send + Sync {
    /// Wall-clock budget of the invocation, if the host imposes one.
    fn time_limit(&self) -> Option<Duration>;

    /// Memory ceiling in bytes, if known.
    fn memory_limit(&self) -> Option<u64>;

    /// Current resident memory in bytes, if measurable.
    fn memory_usage(&self) -> Option<u64>;

    /// Hint that a good moment to return memory has come.
    fn release_memory(&self) {}
}

/// Environment of the current OS process.
///
/// Limits come from configuration; usage is read from `/proc/self/statm`
/// where available.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnvironment {
    time_limit: Option<Duration>,
    memory_limit: Option<u64>,
}

impl ProcessEnvironment {
    pub fn new(time_limit: Option<Duration>, memory_limit: Option<u64>) -> Self {
        Self {
            time_limit,
            memory_limit,
        }
    }
}

const PAGE_SIZE: u64 = 4096;

impl ExecutionEnvironment for ProcessEnvironment {
    fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    fn memory_limit(&self) -> Option<u64> {
        self.memory_limit
    }

    fn memory_usage(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(resident_pages * PAGE_SIZE)
    }

    fn release_memory(&self) {
        debug!(usage = ?self.memory_usage(), "memory release checkpoint");
    }
}

/// Time and memory allowance of one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceBudget {
    pub time: Duration,
    pub memory: u64,
}

impl SliceBudget {
    /// `margin` of the environment's limits, or of the fallbacks when a
    /// limit is unknown.
    pub fn compute(
        env: &dyn ExecutionEnvironment,
        fallback_time: Duration,
        fallback_memory: u64,
        margin: f64,
    ) -> Self {
        let margin = margin.clamp(0.0, 1.0);
        let time = env.time_limit().unwrap_or(fallback_time);
        let memory = env.memory_limit().unwrap_or(fallback_memory);
        Self {
            time: time.mul_f64(margin),
            memory: (memory as f64 * margin) as u64,
        }
    }

    /// Whether the slice may start another iteration.
    pub fn allows(&self, elapsed: Duration, memory_usage: Option<u64>) -> bool {
        elapsed < self.time && memory_usage.is_none_or(|used| used < self.memory)
    }
}
