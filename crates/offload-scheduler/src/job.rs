use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Stopped,
    Running,
    Paused,
}

/// Persisted progress of one job type (`jobs/{type}/state`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobState {
    pub status: JobStatus,
    pub iterations_total: u64,
    pub iterations_done: u64,
    pub failed_count: u64,
    /// Epoch seconds; the job type is locked while this is in the future.
    pub lock_until: i64,
    pub completed: bool,
    /// Epoch seconds of the last persisted iteration.
    pub last_run: i64,
}

impl JobState {
    pub fn is_locked(&self, now: i64) -> bool {
        self.lock_until > now
    }

    pub fn is_finished(&self) -> bool {
        self.iterations_done >= self.iterations_total
    }

    /// Completed, or stopped before finishing a run that was started.
    pub(crate) fn awaits_reset(&self) -> bool {
        self.completed || (self.status == JobStatus::Stopped && self.iterations_total > 0)
    }
}

/// Persisted control flags of one job type (`jobs/{type}/control`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobControl {
    pub pause_requested: bool,
    pub stop_requested: bool,
    /// Epoch seconds of the last control mutation.
    pub time: i64,
}

impl JobControl {
    pub fn has_request(&self) -> bool {
        self.pause_requested || self.stop_requested
    }
}

/// Derived, read-only view returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_type: String,
    pub status: JobStatus,
    pub completed: bool,
    pub done: u64,
    pub total: u64,
    pub failed: u64,
    pub remaining: u64,
    pub percentage: u8,
    pub pause_requested: bool,
    pub stop_requested: bool,
    pub locked: bool,
    pub last_run: i64,
}

impl JobSnapshot {
    pub fn new(job_type: &str, state: &JobState, control: &JobControl, now: i64) -> Self {
        let percentage = if state.iterations_total == 0 {
            0
        } else {
            (state.iterations_done.min(state.iterations_total) * 100 / state.iterations_total)
                as u8
        };
        Self {
            job_type: job_type.to_string(),
            status: state.status,
            completed: state.completed,
            done: state.iterations_done,
            total: state.iterations_total,
            failed: state.failed_count,
            remaining: state.iterations_total.saturating_sub(state.iterations_done),
            percentage,
            pause_requested: control.pause_requested,
            stop_requested: control.stop_requested,
            locked: state.is_locked(now),
            last_run: state.last_run,
        }
    }

    /// Human-facing status, `completed` taking precedence.
    pub fn label(&self) -> &'static str {
        if self.completed {
            return "completed";
        }
        match self.status {
            JobStatus::Stopped => "stopped",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
        }
    }
}
