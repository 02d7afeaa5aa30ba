//! Background job scheduler.
//!
//! Long backlogs are processed as a series of short slices, one per external
//! trigger. Job state and control flags live in a `StateStore` and every
//! read-modify-write on them is a compare-and-swap, so overlapping triggers
//! never run the same job type twice.

mod environment;
mod error;
mod job;
mod scheduler;

pub use environment::{ExecutionEnvironment, ProcessEnvironment, SliceBudget};
pub use error::SchedulerError;
pub use job::{JobControl, JobSnapshot, JobState, JobStatus};
pub use scheduler::{JobHandler, JobScheduler, SchedulerConfig, SliceOutcome, TickReport};
