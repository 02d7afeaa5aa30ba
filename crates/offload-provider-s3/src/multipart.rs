//! Resumable multipart uploads.
//!
//! Progress lives in a serializable `MultipartState`. After a part fails the
//! uploader rebuilds itself from that state plus the parts the backend reports,
//! so parts that already landed are never sent again.

use std::io::SeekFrom;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::error::ObjectStoreError;
use crate::store::{ObjectStore, PutOptions, UploadedPart};

/// Resume attempts before the upload is aborted.
const MAX_RESUMES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartState {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    pub part_size: u64,
    pub total_size: u64,
    #[serde(default)]
    pub parts: Vec<UploadedPart>,
}

impl MultipartState {
    pub fn part_count(&self) -> i32 {
        if self.total_size == 0 {
            return 1;
        }
        self.total_size.div_ceil(self.part_size.max(1)) as i32
    }

    /// Lowest part number not acknowledged yet.
    pub fn next_missing_part(&self) -> Option<i32> {
        (1..=self.part_count()).find(|n| !self.parts.iter().any(|p| p.part_number == *n))
    }

    /// Byte offset and length of `part_number` (1-based).
    pub fn part_range(&self, part_number: i32) -> (u64, u64) {
        let offset = (part_number as u64 - 1) * self.part_size;
        let len = self.part_size.min(self.total_size.saturating_sub(offset));
        (offset, len)
    }

    pub fn is_complete(&self) -> bool {
        self.next_missing_part().is_none()
    }
}

pub struct MultipartUploader<'a> {
    store: &'a dyn ObjectStore,
    path: &'a Path,
    state: MultipartState,
}

impl<'a> MultipartUploader<'a> {
    /// Open a new multipart upload for the file at `path`.
    pub async fn start(
        store: &'a dyn ObjectStore,
        path: &'a Path,
        bucket: &str,
        key: &str,
        part_size: u64,
        options: &PutOptions,
    ) -> Result<MultipartUploader<'a>, ObjectStoreError> {
        let total_size = tokio::fs::metadata(path)
            .await
            .map_err(|e| ObjectStoreError::Other(format!("stat {}: {}", path.display(), e)))?
            .len();
        let upload_id = store.create_multipart_upload(bucket, key, options).await?;
        debug!(key, upload_id, total_size, "multipart upload started");

        Ok(Self {
            store,
            path,
            state: MultipartState {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id,
                part_size: part_size.max(1),
                total_size,
                parts: Vec::new(),
            },
        })
    }

    /// Continue from saved state, trusting the backend's part list when it can
    /// be read and the saved list otherwise.
    pub async fn resume(
        store: &'a dyn ObjectStore,
        path: &'a Path,
        mut state: MultipartState,
    ) -> MultipartUploader<'a> {
        match store
            .list_parts(&state.bucket, &state.key, &state.upload_id)
            .await
        {
            Ok(parts) => state.parts = parts,
            Err(e) => warn!(
                key = %state.key,
                error = %e,
                "could not list uploaded parts, resuming from saved state"
            ),
        }
        Self { store, path, state }
    }

    pub fn state(&self) -> &MultipartState {
        &self.state
    }

    /// Upload the next missing part. Returns `false` once every part is in.
    pub async fn upload_next(&mut self) -> Result<bool, ObjectStoreError> {
        let Some(part_number) = self.state.next_missing_part() else {
            return Ok(false);
        };
        let (offset, len) = self.state.part_range(part_number);
        let data = read_range(self.path, offset, len).await?;

        let etag = self
            .store
            .upload_part(
                &self.state.bucket,
                &self.state.key,
                &self.state.upload_id,
                part_number,
                data,
            )
            .await?;

        self.state.parts.push(UploadedPart {
            part_number,
            etag,
            size: len,
        });
        self.state.parts.sort_by_key(|p| p.part_number);
        Ok(true)
    }

    pub async fn complete(self) -> Result<(), ObjectStoreError> {
        self.store
            .complete_multipart_upload(
                &self.state.bucket,
                &self.state.key,
                &self.state.upload_id,
                &self.state.parts,
            )
            .await
    }

    async fn abort(&self) {
        if let Err(e) = self
            .store
            .abort_multipart_upload(&self.state.bucket, &self.state.key, &self.state.upload_id)
            .await
        {
            warn!(key = %self.state.key, error = %e, "failed to abort multipart upload");
        }
    }
}

async fn read_range(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>, ObjectStoreError> {
    let io_err = |e: std::io::Error| ObjectStoreError::Other(format!("read {}: {}", path.display(), e));
    let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
    file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await.map_err(io_err)?;
    Ok(buf)
}

/// Upload `path` in parts of `part_size` bytes, resuming after part failures.
///
/// The upload is aborted when it cannot be finished, so no orphaned parts
/// are left behind.
pub async fn upload_multipart(
    store: &dyn ObjectStore,
    path: &Path,
    bucket: &str,
    key: &str,
    part_size: u64,
    options: &PutOptions,
) -> Result<(), ObjectStoreError> {
    let mut uploader = MultipartUploader::start(store, path, bucket, key, part_size, options).await?;
    let mut resumes = 0;

    loop {
        match uploader.upload_next().await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) if resumes < MAX_RESUMES => {
                resumes += 1;
                warn!(key, resumes, error = %e, "multipart part failed, resuming");
                let saved = uploader.state().clone();
                uploader = MultipartUploader::resume(store, path, saved).await;
            }
            Err(e) => {
                uploader.abort().await;
                return Err(e);
            }
        }
    }

    let parts = uploader.state().parts.len();
    let upload_id = uploader.state().upload_id.clone();
    match uploader.complete().await {
        Ok(()) => {
            info!(key, parts, resumes, "multipart upload completed");
            Ok(())
        }
        Err(e) => {
            if let Err(abort_err) = store.abort_multipart_upload(bucket, key, &upload_id).await {
                warn!(key, error = %abort_err, "failed to abort multipart upload");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use tempfile::TempDir;

    async fn write_file(dir: &TempDir, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.path().join("big.bin");
        tokio::fs::write(&path, &data).await.unwrap();
        (path, data)
    }

    #[test]
    fn test_part_ranges() {
        let state = MultipartState {
            bucket: "b".into(),
            key: "k".into(),
            upload_id: "u".into(),
            part_size: 10,
            total_size: 25,
            parts: vec![UploadedPart {
                part_number: 1,
                etag: "e".into(),
                size: 10,
            }],
        };
        assert_eq!(state.part_count(), 3);
        assert_eq!(state.part_range(3), (20, 5));
        assert_eq!(state.next_missing_part(), Some(2));
    }

    #[tokio::test]
    async fn test_resumes_without_resending_parts() {
        let dir = TempDir::new().unwrap();
        let (path, data) = write_file(&dir, 25).await;
        let store = MemoryObjectStore::new().with_bucket("b");
        store.fail_part(2, 1);

        upload_multipart(&store, &path, "b", "big.bin", 10, &PutOptions::default())
            .await
            .unwrap();

        assert_eq!(store.part_attempts(1), 1);
        assert_eq!(store.part_attempts(2), 2);
        assert_eq!(store.part_attempts(3), 1);
        assert_eq!(store.object("b", "big.bin").unwrap(), data);
        assert_eq!(store.completed_uploads(), 1);
    }

    #[tokio::test]
    async fn test_aborts_after_repeated_failures() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(&dir, 25).await;
        let store = MemoryObjectStore::new().with_bucket("b");
        store.fail_part(1, 100);

        let result =
            upload_multipart(&store, &path, "b", "big.bin", 10, &PutOptions::default()).await;

        assert!(result.is_err());
        assert!(!store.contains("b", "big.bin"));
        assert_eq!(store.aborted_uploads(), 1);
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_resume_from_saved_state() {
        let dir = TempDir::new().unwrap();
        let (path, data) = write_file(&dir, 25).await;
        let store = MemoryObjectStore::new().with_bucket("b");

        let mut uploader =
            MultipartUploader::start(&store, &path, "b", "big.bin", 10, &PutOptions::default())
                .await
                .unwrap();
        assert!(uploader.upload_next().await.unwrap());

        // state survives a process restart as JSON
        let saved = serde_json::to_string(uploader.state()).unwrap();
        drop(uploader);
        let state: MultipartState = serde_json::from_str(&saved).unwrap();

        let mut resumed = MultipartUploader::resume(&store, &path, state).await;
        while resumed.upload_next().await.unwrap() {}
        resumed.complete().await.unwrap();

        assert_eq!(store.part_attempts(1), 1);
        assert_eq!(store.object("b", "big.bin").unwrap(), data);
    }
}
