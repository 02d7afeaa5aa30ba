use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OffloadError;

/// Numeric result codes shared by provider calls and the per-item error log.
pub mod codes {
    pub const OK: u16 = 200;
    pub const INVALID_CONFIG: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const MISSING_FILE: u16 = 404;
    pub const UNSUPPORTED: u16 = 415;
    pub const UPLOAD_FAILED: u16 = 500;
}

/// Uniform result of every provider operation.
///
/// Backend SDK errors never escape a provider; they are folded into
/// `success = false` with a code and a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult<T> {
    pub success: bool,
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub data: Option<T>,
}

impl<T> ProviderResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            code: codes::OK,
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            code: codes::OK,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn failure(code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Re-type a failed result, keeping its code and message.
    pub fn cast<U>(self) -> ProviderResult<U> {
        ProviderResult {
            success: self.success,
            code: self.code,
            message: self.message,
            data: None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        if self.success {
            self.data
        } else {
            None
        }
    }
}

impl ProviderResult<()> {
    pub fn done() -> Self {
        Self::ok(())
    }
}

/// Opaque backend configuration: access keys, region/endpoint, bucket...
///
/// Each backend reads the entries it understands and ignores the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderSettings(pub serde_json::Map<String, serde_json::Value>);

impl ProviderSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Non-empty string entry.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str, OffloadError> {
        self.string(key)
            .ok_or_else(|| OffloadError::Config(format!("missing setting '{}'", key)))
    }

    pub fn u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => matches!(s.as_str(), "1" | "true" | "yes"),
            _ => false,
        }
    }
}

/// Bucket addressed by bucket-level operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: None,
        }
    }
}

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialCheck {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub buckets: Option<Vec<String>>,
}

/// Remote location of a freshly uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedObject {
    pub key: String,
    pub file_url: String,
}

/// Uniform contract over remote object-storage backends.
///
/// A provider is bound to one backend scope (variant, bucket, region) when it
/// is constructed; callers never see backend-specific error types.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider identifier stored in relationship rows ("aws", "r2"...).
    fn provider_key(&self) -> &'static str;

    /// Bucket objects are written to.
    fn bucket(&self) -> &str;

    /// Region of the bucket, empty when the backend has none.
    fn region(&self) -> &str;

    /// Probe credential validity without requiring an existing bucket.
    async fn verify_credentials(&self) -> CredentialCheck;

    async fn verify_bucket_exists(&self, bucket: &BucketConfig) -> ProviderResult<()>;

    /// Create a bucket and apply the backend's default bucket settings.
    async fn create_bucket(&self, bucket: &BucketConfig) -> ProviderResult<()>;

    async fn verify_object_write_permission(&self) -> ProviderResult<()>;

    async fn verify_object_delete_permission(&self) -> ProviderResult<()>;

    async fn verify_object_read_permission(&self) -> ProviderResult<()>;

    /// Upload one local file under `prefix` + `relative_path`.
    async fn upload_single(
        &self,
        absolute_path: &Path,
        relative_path: &str,
        prefix: &str,
        private: bool,
    ) -> ProviderResult<UploadedObject>;

    async fn delete_single(&self, key: &str) -> ProviderResult<()>;

    /// Download an object to `save_path`, creating parent directories.
    async fn object_to_server(&self, key: &str, save_path: &Path) -> ProviderResult<()>;

    /// Server-side copy of `key` to `new_key`.
    ///
    /// Copies do not inherit the source ACL, so the caller restates privacy.
    async fn copy_to_new_path(&self, key: &str, new_key: &str, private: bool)
        -> ProviderResult<()>;

    fn generate_file_url(&self, key: &str) -> String;

    fn is_provider_url(&self, url: &str) -> bool;

    /// Time-limited signed URL; `None` uses the configured default expiry.
    async fn get_private_url(&self, key: &str, expires_in: Option<Duration>) -> ProviderResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_accessors() {
        let settings = ProviderSettings::new()
            .with("bucket", "media")
            .with("empty", "  ")
            .with("expiry", "120")
            .with("private", true);

        assert_eq!(settings.string("bucket"), Some("media"));
        assert_eq!(settings.string("empty"), None);
        assert_eq!(settings.u64("expiry"), Some(120));
        assert!(settings.flag("private"));
        assert!(!settings.flag("missing"));
        assert!(settings.require("secret").unwrap_err().to_string().contains("secret"));
    }

    #[test]
    fn test_result_cast_keeps_failure() {
        let failed: ProviderResult<String> = ProviderResult::failure(codes::MISSING_FILE, "gone");
        let cast: ProviderResult<()> = failed.cast();
        assert!(!cast.success);
        assert_eq!(cast.code, 404);
        assert_eq!(cast.message, "gone");
        assert!(ProviderResult::ok(3).into_data() == Some(3));
    }
}
