use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use offload_core::{
    codes, BucketConfig, CredentialCheck, OffloadError, Provider, ProviderResult,
    ProviderSettings, UploadedObject,
};
use tracing::{debug, info, instrument, warn};

use crate::error::ObjectStoreError;
use crate::keys::{content_type_for, encode_key_for_url, generate_object_key, sentinel_key};
use crate::multipart::upload_multipart;
use crate::s3::S3ObjectStore;
use crate::store::{ObjectAcl, ObjectStore, PutOptions};
use crate::variant::ProviderVariant;

/// Signed URLs live this long unless the caller or settings say otherwise.
pub const DEFAULT_PRIVATE_URL_EXPIRY: Duration = Duration::from_secs(20 * 60);
/// Multipart part size (S3 minimum is 5 MiB for all but the last part).
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

const SENTINEL_BODY: &[u8] = b"offload permission check";

/// `Provider` for every S3-compatible variant.
///
/// Configuration is resolved once at construction; every call afterwards
/// uses the same variant, bucket and region.
pub struct S3CompatibleProvider {
    store: Arc<dyn ObjectStore>,
    variant: ProviderVariant,
    bucket: String,
    region: String,
    domain: String,
    multipart_threshold: u64,
    part_size: u64,
    private_url_expiry: Duration,
}

impl S3CompatibleProvider {
    /// Resolve the variant and build an `aws-sdk-s3` backed provider.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, OffloadError> {
        let variant = ProviderVariant::resolve(settings)?;
        let store = S3ObjectStore::from_settings(&variant, settings)?;
        Self::with_store(variant, Arc::new(store), settings)
    }

    /// Build a provider over any `ObjectStore`.
    ///
    /// Reads `bucket` (required), `region`, `public_domain` (required for R2),
    /// `private_url_expiry_secs`, `multipart_threshold` and `part_size`.
    pub fn with_store(
        variant: ProviderVariant,
        store: Arc<dyn ObjectStore>,
        settings: &ProviderSettings,
    ) -> Result<Self, OffloadError> {
        let bucket = settings.require("bucket")?.to_string();
        let region = settings
            .string("region")
            .map(str::to_string)
            .unwrap_or_else(|| variant.default_region().to_string());
        let domain = settings
            .string("public_domain")
            .map(|d| d.trim_end_matches('/').to_string())
            .or_else(|| variant.default_domain(&bucket, &region))
            .ok_or_else(|| {
                OffloadError::Config(format!(
                    "setting 'public_domain' is required for provider '{}'",
                    variant.provider_key()
                ))
            })?;
        let multipart_threshold = settings
            .u64("multipart_threshold")
            .unwrap_or_else(|| variant.multipart_threshold());
        let part_size = settings.u64("part_size").unwrap_or(DEFAULT_PART_SIZE);
        let private_url_expiry = settings
            .u64("private_url_expiry_secs")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PRIVATE_URL_EXPIRY);

        Ok(Self {
            store,
            variant,
            bucket,
            region,
            domain,
            multipart_threshold,
            part_size,
            private_url_expiry,
        })
    }

    pub fn variant(&self) -> &ProviderVariant {
        &self.variant
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn scheme(&self) -> &'static str {
        if self.variant.insecure_scheme() {
            "http"
        } else {
            "https"
        }
    }

    fn acl(&self, private: bool) -> Option<ObjectAcl> {
        if !self.variant.supports_acl() {
            return None;
        }
        Some(if private {
            ObjectAcl::Private
        } else {
            ObjectAcl::PublicRead
        })
    }

    fn put_options(&self, key: &str, private: bool) -> PutOptions {
        PutOptions {
            content_type: content_type_for(key).map(str::to_string),
            acl: self.acl(private),
        }
    }

    /// Write a sentinel object, run `check` against it, then clean it up.
    async fn with_sentinel<F, Fut>(&self, permission: &str, check: F) -> ProviderResult<()>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = ProviderResult<()>>,
    {
        let key = sentinel_key(&uuid::Uuid::new_v4().to_string());
        let options = self.put_options(&key, true);

        if let Err(e) = self
            .store
            .put_object(&self.bucket, &key, SENTINEL_BODY.to_vec(), &options)
            .await
        {
            return ProviderResult::failure(
                codes::FORBIDDEN,
                format!("{} check could not create a test object: {}", permission, e),
            );
        }

        let result = check(key.clone()).await;

        if let Err(e) = self.store.delete_object(&self.bucket, &key).await {
            warn!(key, error = %e, "failed to remove permission sentinel");
        }
        result
    }

    fn failure<T>(e: &ObjectStoreError) -> ProviderResult<T> {
        ProviderResult::failure(e.code(), e.to_string())
    }
}

fn local_mtime(meta: &std::fs::Metadata) -> Option<i64> {
    meta.modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

#[async_trait]
impl Provider for S3CompatibleProvider {
    fn provider_key(&self) -> &'static str {
        self.variant.provider_key()
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn region(&self) -> &str {
        &self.region
    }

    #[instrument(skip(self), level = "debug")]
    async fn verify_credentials(&self) -> CredentialCheck {
        match self.store.list_buckets().await {
            Ok(buckets) => CredentialCheck {
                success: true,
                message: "Credentials verified".to_string(),
                buckets: Some(buckets),
            },
            // Listing is not the only way in: a scoped key may see no buckets
            Err(e) if e.is_not_found() => CredentialCheck {
                success: true,
                message: "Credentials verified; no accessible buckets listed".to_string(),
                buckets: None,
            },
            Err(e) => CredentialCheck {
                success: false,
                message: e.to_string(),
                buckets: None,
            },
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn verify_bucket_exists(&self, bucket: &BucketConfig) -> ProviderResult<()> {
        match self.store.head_bucket(&bucket.name).await {
            Ok(()) => ProviderResult::done(),
            Err(e) => Self::failure(&e),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_bucket(&self, bucket: &BucketConfig) -> ProviderResult<()> {
        let region = bucket.region.as_deref().unwrap_or(&self.region);
        if let Err(e) = self.store.create_bucket(&bucket.name, Some(region)).await {
            return Self::failure(&e);
        }
        if self.variant.needs_bucket_defaults() {
            if let Err(e) = self.store.apply_bucket_defaults(&bucket.name).await {
                return ProviderResult::failure(
                    e.code(),
                    format!("bucket created but default settings failed: {}", e),
                );
            }
        }
        info!(bucket = %bucket.name, provider = self.provider_key(), "bucket created");
        ProviderResult::done()
    }

    async fn verify_object_write_permission(&self) -> ProviderResult<()> {
        self.with_sentinel("write", |key| async move {
            match self.store.head_object(&self.bucket, &key).await {
                Ok(Some(_)) => ProviderResult::done(),
                Ok(None) => ProviderResult::failure(
                    codes::FORBIDDEN,
                    "write reported success but the object is not present",
                ),
                Err(e) => Self::failure(&e),
            }
        })
        .await
    }

    async fn verify_object_delete_permission(&self) -> ProviderResult<()> {
        self.with_sentinel("delete", |key| async move {
            if let Err(e) = self.store.delete_object(&self.bucket, &key).await {
                return ProviderResult::failure(codes::FORBIDDEN, e.to_string());
            }
            match self.store.head_object(&self.bucket, &key).await {
                Ok(None) => ProviderResult::done(),
                Ok(Some(_)) => ProviderResult::failure(
                    codes::FORBIDDEN,
                    "delete reported success but the object is still present",
                ),
                Err(e) => Self::failure(&e),
            }
        })
        .await
    }

    async fn verify_object_read_permission(&self) -> ProviderResult<()> {
        self.with_sentinel("read", |key| async move {
            match self.store.get_object(&self.bucket, &key).await {
                Ok(Some((data, _))) if data == SENTINEL_BODY => ProviderResult::done(),
                Ok(_) => ProviderResult::failure(
                    codes::FORBIDDEN,
                    "read did not return the test object",
                ),
                Err(e) => ProviderResult::failure(codes::FORBIDDEN, e.to_string()),
            }
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn upload_single(
        &self,
        absolute_path: &Path,
        relative_path: &str,
        prefix: &str,
        private: bool,
    ) -> ProviderResult<UploadedObject> {
        let meta = match tokio::fs::metadata(absolute_path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                return ProviderResult::failure(
                    codes::UNSUPPORTED,
                    format!("{} is not a regular file", absolute_path.display()),
                )
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ProviderResult::failure(
                    codes::MISSING_FILE,
                    format!("file not found: {}", absolute_path.display()),
                )
            }
            Err(e) => return ProviderResult::failure(codes::UPLOAD_FAILED, e.to_string()),
        };

        let key = generate_object_key(relative_path, prefix);
        if key.is_empty() {
            return ProviderResult::failure(codes::UNSUPPORTED, "empty object key");
        }
        let uploaded = UploadedObject {
            file_url: self.generate_file_url(&key),
            key: key.clone(),
        };

        let size = meta.len();
        match self.store.head_object(&self.bucket, &key).await {
            Ok(Some(head))
                if head.size == size
                    && head.last_modified.unwrap_or(0) >= local_mtime(&meta).unwrap_or(0) =>
            {
                debug!(key, size, "object already uploaded, skipping");
                return ProviderResult::ok_with_message(uploaded, "already uploaded");
            }
            Ok(_) => {}
            Err(e) => debug!(key, error = %e, "existence check failed, uploading anyway"),
        }

        let options = self.put_options(&key, private);
        let outcome = if size > self.multipart_threshold {
            upload_multipart(
                self.store.as_ref(),
                absolute_path,
                &self.bucket,
                &key,
                self.part_size,
                &options,
            )
            .await
        } else {
            match tokio::fs::read(absolute_path).await {
                Ok(data) => self
                    .store
                    .put_object(&self.bucket, &key, data, &options)
                    .await
                    .map(|_| ()),
                Err(e) => {
                    return ProviderResult::failure(codes::UPLOAD_FAILED, e.to_string());
                }
            }
        };

        match outcome {
            Ok(()) => {
                debug!(key, size, multipart = size > self.multipart_threshold, "uploaded");
                ProviderResult::ok(uploaded)
            }
            Err(e) => ProviderResult::failure(codes::UPLOAD_FAILED, e.to_string()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_single(&self, key: &str) -> ProviderResult<()> {
        match self.store.delete_object(&self.bucket, key).await {
            Ok(()) | Err(ObjectStoreError::NotFound(_)) => ProviderResult::done(),
            Err(e) => Self::failure(&e),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn object_to_server(&self, key: &str, save_path: &Path) -> ProviderResult<()> {
        if let Some(parent) = save_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ProviderResult::failure(
                    codes::UPLOAD_FAILED,
                    format!("cannot create {}: {}", parent.display(), e),
                );
            }
        }

        let data = match self.store.get_object(&self.bucket, key).await {
            Ok(Some((data, _))) => data,
            Ok(None) => {
                return ProviderResult::failure(
                    codes::MISSING_FILE,
                    format!("object not found: {}", key),
                )
            }
            Err(e) => return Self::failure(&e),
        };

        match tokio::fs::write(save_path, data).await {
            Ok(()) => ProviderResult::done(),
            Err(e) => ProviderResult::failure(codes::UPLOAD_FAILED, e.to_string()),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy_to_new_path(&self, key: &str, new_key: &str, private: bool) -> ProviderResult<()> {
        match self.store.head_object(&self.bucket, key).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return ProviderResult::failure(
                    codes::MISSING_FILE,
                    format!("source object not found: {}", key),
                )
            }
            Err(e) => return Self::failure(&e),
        }

        match self.store.head_object(&self.bucket, new_key).await {
            Ok(Some(_)) => {
                debug!(new_key, "destination exists, skipping copy");
                return ProviderResult::ok_with_message((), "destination already exists");
            }
            Ok(None) => {}
            Err(e) => return Self::failure(&e),
        }

        let options = self.put_options(new_key, private);
        if let Err(e) = self
            .store
            .copy_object(&self.bucket, key, new_key, &options)
            .await
        {
            return Self::failure(&e);
        }

        match self.store.head_object(&self.bucket, new_key).await {
            Ok(Some(_)) => ProviderResult::done(),
            Ok(None) => ProviderResult::failure(
                codes::UPLOAD_FAILED,
                format!("copy reported success but {} is missing", new_key),
            ),
            Err(e) => Self::failure(&e),
        }
    }

    fn generate_file_url(&self, key: &str) -> String {
        format!(
            "{}://{}/{}",
            self.scheme(),
            self.domain,
            encode_key_for_url(key.trim_start_matches('/'))
        )
    }

    fn is_provider_url(&self, url: &str) -> bool {
        let without_scheme = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .unwrap_or(url);
        without_scheme.starts_with(&format!("{}/", self.domain))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_private_url(
        &self,
        key: &str,
        expires_in: Option<Duration>,
    ) -> ProviderResult<String> {
        let expires_in = expires_in.unwrap_or(self.private_url_expiry);
        match self.store.presign_get(&self.bucket, key, expires_in).await {
            Ok(url) => ProviderResult::ok(url),
            Err(e) => Self::failure(&e),
        }
    }
}
