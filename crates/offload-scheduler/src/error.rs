use offload_core::OffloadError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Unknown job type: {0}")]
    UnknownJob(String),

    #[error("State error: {0}")]
    State(#[from] OffloadError),
}
