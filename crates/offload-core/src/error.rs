/// Errors shared by every offload crate.
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Uniqueness violation: {0}")]
    Conflict(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<serde_json::Error> for OffloadError {
    fn from(e: serde_json::Error) -> Self {
        OffloadError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for OffloadError {
    fn from(e: std::io::Error) -> Self {
        OffloadError::Io(e.to_string())
    }
}
