//! In-process `ObjectStore` for tests and dry runs.
//!
//! Mirrors the S3 semantics the provider relies on (quoted content ETags,
//! conditional writes, multipart parts) and adds failure injection hooks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::ObjectStoreError;
use crate::store::{ObjectAcl, ObjectHead, ObjectStore, PutOptions, UploadedPart};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    acl: Option<ObjectAcl>,
    content_type: Option<String>,
    modified: i64,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    options: PutOptions,
    parts: BTreeMap<i32, (Vec<u8>, String)>,
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    /// bucket name -> defaults applied
    buckets: DashMap<String, bool>,
    objects: DashMap<(String, String), StoredObject>,
    uploads: DashMap<String, PendingUpload>,
    next_upload: AtomicU64,
    completed_uploads: AtomicU64,
    aborted_uploads: AtomicU64,

    // failure injection
    part_failures: DashMap<i32, u32>,
    part_attempts: DashMap<i32, u32>,
    ignore_deletes: AtomicBool,
    deny_writes: AtomicBool,
    list_error: RwLock<Option<ObjectStoreError>>,
}

fn etag_for(data: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(data)))
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, bucket: &str) -> Self {
        self.buckets.insert(bucket.to_string(), false);
        self
    }

    pub fn add_bucket(&self, bucket: &str) {
        self.buckets.entry(bucket.to_string()).or_insert(false);
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets.contains_key(bucket)
    }

    pub fn bucket_defaults_applied(&self, bucket: &str) -> bool {
        self.buckets.get(bucket).map(|b| *b).unwrap_or(false)
    }

    /// Seed an object directly, bypassing bucket checks.
    pub fn insert_object(&self, bucket: &str, key: &str, data: &[u8]) {
        self.add_bucket(bucket);
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.to_vec(),
                etag: etag_for(data),
                acl: None,
                content_type: None,
                modified: now_secs(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn object_acl(&self, bucket: &str, key: &str) -> Option<ObjectAcl> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|o| o.acl)
    }

    pub fn object_content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|o| o.content_type.clone())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Keys in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Fail the next `times` attempts to upload `part_number`.
    pub fn fail_part(&self, part_number: i32, times: u32) {
        self.part_failures.insert(part_number, times);
    }

    /// How many times `part_number` was sent, failed attempts included.
    pub fn part_attempts(&self, part_number: i32) -> u32 {
        self.part_attempts
            .get(&part_number)
            .map(|n| *n)
            .unwrap_or(0)
    }

    pub fn completed_uploads(&self) -> u64 {
        self.completed_uploads.load(Ordering::SeqCst)
    }

    pub fn aborted_uploads(&self) -> u64 {
        self.aborted_uploads.load(Ordering::SeqCst)
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Make deletes report success without removing anything.
    pub fn ignore_deletes(&self, ignore: bool) {
        self.ignore_deletes.store(ignore, Ordering::SeqCst);
    }

    /// Reject every write with `AccessDenied`.
    pub fn deny_writes(&self, deny: bool) {
        self.deny_writes.store(deny, Ordering::SeqCst);
    }

    /// Make `list_buckets` fail with `error` (`None` clears it).
    pub fn fail_list_buckets(&self, error: Option<ObjectStoreError>) {
        if let Ok(mut slot) = self.list_error.write() {
            *slot = error;
        }
    }

    fn require_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        if self.buckets.contains_key(bucket) {
            Ok(())
        } else {
            Err(ObjectStoreError::BucketMissing(bucket.to_string()))
        }
    }

    fn check_writable(&self, key: &str) -> Result<(), ObjectStoreError> {
        if self.deny_writes.load(Ordering::SeqCst) {
            Err(ObjectStoreError::AccessDenied(format!("write to {} denied", key)))
        } else {
            Ok(())
        }
    }

    fn store_object(&self, bucket: &str, key: &str, data: Vec<u8>, options: &PutOptions) -> String {
        let etag = etag_for(&data);
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                etag: etag.clone(),
                acl: options.acl,
                content_type: options.content_type.clone(),
                modified: now_secs(),
            },
        );
        etag
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_buckets(&self) -> Result<Vec<String>, ObjectStoreError> {
        if let Some(error) = self.list_error.read().ok().and_then(|slot| slot.clone()) {
            return Err(error);
        }
        let mut names: Vec<String> = self.buckets.iter().map(|b| b.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn head_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        self.require_bucket(bucket)
    }

    async fn create_bucket(
        &self,
        bucket: &str,
        _region: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        self.check_writable(bucket)?;
        self.add_bucket(bucket);
        Ok(())
    }

    async fn apply_bucket_defaults(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        self.require_bucket(bucket)?;
        self.buckets.insert(bucket.to_string(), true);
        Ok(())
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectHead>, ObjectStoreError> {
        self.require_bucket(bucket)?;
        Ok(self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| ObjectHead {
                size: o.data.len() as u64,
                etag: Some(o.etag.clone()),
                last_modified: Some(o.modified),
            }))
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<(Vec<u8>, String)>, ObjectStoreError> {
        self.require_bucket(bucket)?;
        Ok(self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| (o.data.clone(), o.etag.clone())))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        options: &PutOptions,
    ) -> Result<String, ObjectStoreError> {
        self.require_bucket(bucket)?;
        self.check_writable(key)?;
        Ok(self.store_object(bucket, key, data, options))
    }

    async fn put_object_conditional(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        expected_etag: Option<&str>,
    ) -> Result<String, ObjectStoreError> {
        self.require_bucket(bucket)?;
        self.check_writable(key)?;

        let entry = self.objects.entry((bucket.to_string(), key.to_string()));
        let current = match &entry {
            dashmap::mapref::entry::Entry::Occupied(o) => Some(o.get().etag.clone()),
            dashmap::mapref::entry::Entry::Vacant(_) => None,
        };
        if current.as_deref() != expected_etag {
            return Err(ObjectStoreError::PreconditionFailed(format!(
                "ETag mismatch on {}",
                key
            )));
        }

        let etag = etag_for(&data);
        entry.insert(StoredObject {
            data,
            etag: etag.clone(),
            acl: None,
            content_type: None,
            modified: now_secs(),
        });
        Ok(etag)
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        self.require_bucket(bucket)?;
        if !self.ignore_deletes.load(Ordering::SeqCst) {
            self.objects.remove(&(bucket.to_string(), key.to_string()));
        }
        Ok(())
    }

    async fn copy_object(
        &self,
        bucket: &str,
        from_key: &str,
        to_key: &str,
        options: &PutOptions,
    ) -> Result<(), ObjectStoreError> {
        self.require_bucket(bucket)?;
        self.check_writable(to_key)?;
        let source = self
            .objects
            .get(&(bucket.to_string(), from_key.to_string()))
            .map(|o| (o.data.clone(), o.content_type.clone()))
            .ok_or_else(|| ObjectStoreError::NotFound(from_key.to_string()))?;

        let options = PutOptions {
            content_type: options.content_type.clone().or(source.1),
            acl: options.acl,
        };
        self.store_object(bucket, to_key, source.0, &options);
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: &PutOptions,
    ) -> Result<String, ObjectStoreError> {
        self.require_bucket(bucket)?;
        self.check_writable(key)?;
        let upload_id = format!("upload-{}", self.next_upload.fetch_add(1, Ordering::SeqCst) + 1);
        self.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                options: options.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<String, ObjectStoreError> {
        *self.part_attempts.entry(part_number).or_insert(0) += 1;

        if let Some(mut remaining) = self.part_failures.get_mut(&part_number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ObjectStoreError::Other(format!(
                    "injected failure for part {}",
                    part_number
                )));
            }
        }

        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| ObjectStoreError::NotFound(format!("upload {}", upload_id)))?;
        let etag = etag_for(&data);
        upload.parts.insert(part_number, (data, etag.clone()));
        Ok(etag)
    }

    async fn list_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, ObjectStoreError> {
        let upload = self
            .uploads
            .get(upload_id)
            .ok_or_else(|| ObjectStoreError::NotFound(format!("upload {}", upload_id)))?;
        Ok(upload
            .parts
            .iter()
            .map(|(number, (data, etag))| UploadedPart {
                part_number: *number,
                etag: etag.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ObjectStoreError> {
        let (_, upload) = self
            .uploads
            .remove(upload_id)
            .ok_or_else(|| ObjectStoreError::NotFound(format!("upload {}", upload_id)))?;

        let mut body = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((data, etag)) if *etag == part.etag => body.extend_from_slice(data),
                _ => {
                    return Err(ObjectStoreError::Other(format!(
                        "invalid part {} for upload {}",
                        part.part_number, upload_id
                    )))
                }
            }
        }

        self.store_object(&upload.bucket, &upload.key, body, &upload.options);
        self.completed_uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError> {
        if self.uploads.remove(upload_id).is_some() {
            self.aborted_uploads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError> {
        self.require_bucket(bucket)?;
        Ok(format!(
            "memory://{}/{}?expires={}",
            bucket,
            key,
            expires_in.as_secs()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_put_semantics() {
        let store = MemoryObjectStore::new().with_bucket("b");

        let v1 = store
            .put_object_conditional("b", "k", b"one".to_vec(), None)
            .await
            .unwrap();
        assert!(matches!(
            store.put_object_conditional("b", "k", b"x".to_vec(), None).await,
            Err(ObjectStoreError::PreconditionFailed(_))
        ));
        let v2 = store
            .put_object_conditional("b", "k", b"two".to_vec(), Some(&v1))
            .await
            .unwrap();
        assert!(store
            .put_object_conditional("b", "k", b"three".to_vec(), Some(&v1))
            .await
            .is_err());
        let (data, etag) = store.get_object("b", "k").await.unwrap().unwrap();
        assert_eq!(data, b"two");
        assert_eq!(etag, v2);
    }

    #[tokio::test]
    async fn test_missing_bucket_is_reported() {
        let store = MemoryObjectStore::new();
        assert!(matches!(
            store.head_object("nope", "k").await,
            Err(ObjectStoreError::BucketMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_part_failure_counts_attempts() {
        let store = MemoryObjectStore::new().with_bucket("b");
        store.fail_part(1, 1);
        let id = store
            .create_multipart_upload("b", "big", &PutOptions::default())
            .await
            .unwrap();

        tokio_test::assert_err!(store.upload_part("b", "big", &id, 1, vec![1]).await);
        let etag = tokio_test::assert_ok!(store.upload_part("b", "big", &id, 1, vec![1]).await);
        assert_eq!(store.part_attempts(1), 2);

        let parts = store.list_parts("b", "big", &id).await.unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].etag, etag);
    }

    #[tokio::test]
    async fn test_ignored_delete_keeps_object() {
        let store = MemoryObjectStore::new();
        store.insert_object("b", "k", b"data");
        store.ignore_deletes(true);
        store.delete_object("b", "k").await.unwrap();
        assert!(store.contains("b", "k"));
    }
}
