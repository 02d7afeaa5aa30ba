use offload_core::{codes, OffloadError};

/// Normalized object-storage failure.
///
/// SDK errors are classified into these kinds right where they are raised, so
/// nothing above the `ObjectStore` seam ever matches on SDK types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Bucket not found: {0}")]
    BucketMissing(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Backend error: {0}")]
    Other(String),
}

impl ObjectStoreError {
    /// 429, 5xx, timeouts and dispatch failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, ObjectStoreError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ObjectStoreError::NotFound(_) | ObjectStoreError::BucketMissing(_)
        )
    }

    /// Result code reported through `ProviderResult`.
    pub fn code(&self) -> u16 {
        match self {
            ObjectStoreError::InvalidCredentials(_) => codes::INVALID_CONFIG,
            ObjectStoreError::AccessDenied(_) => codes::FORBIDDEN,
            ObjectStoreError::BucketMissing(_) | ObjectStoreError::NotFound(_) => {
                codes::MISSING_FILE
            }
            _ => codes::UPLOAD_FAILED,
        }
    }
}

impl From<ObjectStoreError> for OffloadError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::PreconditionFailed(msg) => OffloadError::Lock(msg),
            ObjectStoreError::NotFound(msg) | ObjectStoreError::BucketMissing(msg) => {
                OffloadError::NotFound(msg)
            }
            ObjectStoreError::InvalidCredentials(msg) => OffloadError::Config(msg),
            other => OffloadError::Backend(other.to_string()),
        }
    }
}
