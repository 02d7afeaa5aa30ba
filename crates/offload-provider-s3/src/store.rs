use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ObjectStoreError;

/// Metadata of an existing object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub etag: Option<String>,
    /// Unix seconds.
    pub last_modified: Option<i64>,
}

/// Canned ACL applied on write (only for variants that support ACLs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAcl {
    Private,
    PublicRead,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub acl: Option<ObjectAcl>,
}

/// One part acknowledged by the backend during a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
    pub size: u64,
}

/// Low-level S3-style primitives.
///
/// Implementations classify every backend failure into `ObjectStoreError`
/// and retry transient ones themselves.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<String>, ObjectStoreError>;

    async fn head_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError>;

    async fn create_bucket(&self, bucket: &str, region: Option<&str>)
        -> Result<(), ObjectStoreError>;

    /// Object ownership + public access settings needed before ACL'd writes work.
    async fn apply_bucket_defaults(&self, bucket: &str) -> Result<(), ObjectStoreError>;

    async fn head_object(&self, bucket: &str, key: &str)
        -> Result<Option<ObjectHead>, ObjectStoreError>;

    /// Object body and ETag; `None` if the object does not exist.
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<(Vec<u8>, String)>, ObjectStoreError>;

    /// Returns the new ETag.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        options: &PutOptions,
    ) -> Result<String, ObjectStoreError>;

    /// Conditional write.
    ///
    /// - `expected_etag = Some(etag)`: `If-Match` (update existing)
    /// - `expected_etag = None`: `If-None-Match: *` (create, fail if exists)
    ///
    /// A mismatch is `ObjectStoreError::PreconditionFailed`.
    async fn put_object_conditional(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        expected_etag: Option<&str>,
    ) -> Result<String, ObjectStoreError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError>;

    async fn copy_object(
        &self,
        bucket: &str,
        from_key: &str,
        to_key: &str,
        options: &PutOptions,
    ) -> Result<(), ObjectStoreError>;

    /// Returns the upload id.
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: &PutOptions,
    ) -> Result<String, ObjectStoreError>;

    /// Returns the part ETag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<String, ObjectStoreError>;

    /// Parts the backend already holds for an upload, sorted by part number.
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, ObjectStoreError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ObjectStoreError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Presigned GET URL.
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError>;
}
