use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
    ObjectCannedAcl, ObjectOwnership, OwnershipControls, OwnershipControlsRule,
};
use aws_sdk_s3::Client as S3Client;
use offload_core::{Backoff, OffloadError, ProviderSettings};
use tracing::{debug, instrument, warn};

use crate::error::ObjectStoreError;
use crate::keys::encode_key_for_url;
use crate::store::{ObjectAcl, ObjectHead, ObjectStore, PutOptions, UploadedPart};
use crate::variant::ProviderVariant;

/// Maximum number of retries for transient errors (429, 5xx, timeouts).
const MAX_RETRIES: u32 = 5;
const RETRY_BACKOFF: Backoff =
    Backoff::new(Duration::from_millis(200), MAX_RETRIES, Duration::from_millis(100));

/// `ObjectStore` backed by `aws-sdk-s3`.
///
/// Works against AWS itself and every S3-compatible service: the variant only
/// changes the endpoint, signing region and addressing style of the client.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }

    /// Build the SDK client from `access_key_id`, `secret_access_key` and `region`.
    pub fn from_settings(
        variant: &ProviderVariant,
        settings: &ProviderSettings,
    ) -> Result<Self, OffloadError> {
        let credentials = Credentials::new(
            settings.require("access_key_id")?,
            settings.require("secret_access_key")?,
            None,
            None,
            variant.provider_key(),
        );
        let region = settings.string("region").unwrap_or_default();

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(variant.signing_region(region)))
            .force_path_style(variant.force_path_style());
        if let Some(endpoint) = variant.endpoint(region) {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self::new(S3Client::from_conf(builder.build())))
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }
}

// =========================================================================
// Retry helper
// =========================================================================

/// Run `call` until it succeeds, fails permanently, or runs out of retries.
async fn with_retry<T, F, Fut>(op: &str, key: &str, mut call: F) -> Result<T, ObjectStoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ObjectStoreError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                warn!(attempt, key, op, error = %e, "retryable storage error, retrying");
                RETRY_BACKOFF.sleep(attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Fold an SDK error into an `ObjectStoreError` kind.
fn classify<E>(op: &str, err: SdkError<E, HttpResponse>) -> ObjectStoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = match &err {
        SdkError::ServiceError(e) => Some(e.raw().status().as_u16()),
        SdkError::ResponseError(e) => Some(e.raw().status().as_u16()),
        _ => None,
    };
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .map(str::to_string);
    let transport = matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
    );
    let message = format!("{} failed: {}", op, DisplayErrorContext(&err));

    if transport {
        return ObjectStoreError::Transient(message);
    }

    match (status, code.as_deref()) {
        // 409 ConditionalRequestConflict: a concurrent conditional write won the race
        (Some(412), _)
        | (Some(409), None)
        | (_, Some("PreconditionFailed" | "ConditionalRequestConflict")) => {
            ObjectStoreError::PreconditionFailed(message)
        }
        (
            _,
            Some(
                "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "InvalidToken" | "ExpiredToken",
            ),
        ) => ObjectStoreError::InvalidCredentials(message),
        (_, Some("NoSuchBucket")) => ObjectStoreError::BucketMissing(message),
        (_, Some("NoSuchKey" | "NoSuchUpload" | "NotFound")) | (Some(404), _) => {
            ObjectStoreError::NotFound(message)
        }
        (_, Some("AccessDenied" | "AllAccessDisabled")) | (Some(403), _) => {
            ObjectStoreError::AccessDenied(message)
        }
        (_, Some("SlowDown" | "RequestTimeout" | "InternalError"))
        | (Some(429), _)
        | (Some(500..=504), _) => ObjectStoreError::Transient(message),
        _ => ObjectStoreError::Other(message),
    }
}

fn canned_acl(acl: ObjectAcl) -> ObjectCannedAcl {
    match acl {
        ObjectAcl::Private => ObjectCannedAcl::Private,
        ObjectAcl::PublicRead => ObjectCannedAcl::PublicRead,
    }
}

// =========================================================================
// S3 primitives with retry
// =========================================================================

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), level = "debug")]
    async fn list_buckets(&self) -> Result<Vec<String>, ObjectStoreError> {
        let output = with_retry("list_buckets", "", || async move {
            self.client
                .list_buckets()
                .send()
                .await
                .map_err(|e| classify("list_buckets", e))
        })
        .await?;

        Ok(output
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    #[instrument(skip(self), level = "debug")]
    async fn head_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        let result = with_retry("head_bucket", bucket, || async move {
            self.client
                .head_bucket()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| classify("head_bucket", e))
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(ObjectStoreError::NotFound(msg)) => Err(ObjectStoreError::BucketMissing(msg)),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_bucket(
        &self,
        bucket: &str,
        region: Option<&str>,
    ) -> Result<(), ObjectStoreError> {
        // us-east-1 (and "auto" on R2) must not send a location constraint
        let constraint = region
            .filter(|r| !r.is_empty() && *r != "us-east-1" && *r != "auto")
            .map(|r| {
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(r))
                    .build()
            });

        with_retry("create_bucket", bucket, || {
            let constraint = constraint.clone();
            async move {
                let result = self
                    .client
                    .create_bucket()
                    .bucket(bucket)
                    .set_create_bucket_configuration(constraint)
                    .send()
                    .await;
                match result {
                    Ok(_) => Ok(()),
                    Err(e)
                        if e.as_service_error()
                            .is_some_and(|s| s.is_bucket_already_owned_by_you()) =>
                    {
                        debug!(bucket, "bucket already owned, nothing to create");
                        Ok(())
                    }
                    Err(e) => Err(classify("create_bucket", e)),
                }
            }
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn apply_bucket_defaults(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        let rule = OwnershipControlsRule::builder()
            .object_ownership(ObjectOwnership::BucketOwnerPreferred)
            .build()
            .map_err(|e| ObjectStoreError::Other(e.to_string()))?;
        let controls = OwnershipControls::builder()
            .rules(rule)
            .build()
            .map_err(|e| ObjectStoreError::Other(e.to_string()))?;

        with_retry("put_bucket_ownership_controls", bucket, || {
            let controls = controls.clone();
            async move {
                self.client
                    .put_bucket_ownership_controls()
                    .bucket(bucket)
                    .ownership_controls(controls)
                    .send()
                    .await
                    .map_err(|e| classify("put_bucket_ownership_controls", e))
            }
        })
        .await?;

        // Public-read ACLs stay blocked while the default access block is in place
        let unblocked = with_retry("delete_public_access_block", bucket, || async move {
            self.client
                .delete_public_access_block()
                .bucket(bucket)
                .send()
                .await
                .map_err(|e| classify("delete_public_access_block", e))
        })
        .await;
        match unblocked {
            Ok(_) | Err(ObjectStoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectHead>, ObjectStoreError> {
        let result = with_retry("head_object", key, || async move {
            self.client
                .head_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify("head_object", e))
        })
        .await;

        match result {
            Ok(output) => Ok(Some(ObjectHead {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                etag: output.e_tag().map(str::to_string),
                last_modified: output.last_modified().map(|t| t.secs()),
            })),
            Err(ObjectStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<(Vec<u8>, String)>, ObjectStoreError> {
        let result = with_retry("get_object", key, || async move {
            self.client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify("get_object", e))
        })
        .await;

        let output = match result {
            Ok(output) => output,
            Err(ObjectStoreError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let etag = output.e_tag().unwrap_or("").to_string();
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Transient(format!("Failed to read object body: {}", e)))?
            .into_bytes();
        Ok(Some((bytes.to_vec(), etag)))
    }

    #[instrument(skip(self, data), level = "debug", fields(len = data.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        options: &PutOptions,
    ) -> Result<String, ObjectStoreError> {
        let data = &data;
        let output = with_retry("put_object", key, || async move {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data.clone()))
                .set_content_type(options.content_type.clone())
                .set_acl(options.acl.map(canned_acl))
                .send()
                .await
                .map_err(|e| classify("put_object", e))
        })
        .await?;

        Ok(output.e_tag().unwrap_or("").to_string())
    }

    #[instrument(skip(self, data), level = "debug", fields(len = data.len()))]
    async fn put_object_conditional(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        expected_etag: Option<&str>,
    ) -> Result<String, ObjectStoreError> {
        let data = &data;
        let output = with_retry("put_object_conditional", key, || async move {
            let mut req = self
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(data.clone()));

            if let Some(etag) = expected_etag {
                req = req.if_match(etag);
            } else {
                req = req.if_none_match("*");
            }

            req.send()
                .await
                .map_err(|e| classify("put_object_conditional", e))
        })
        .await?;

        Ok(output.e_tag().unwrap_or("").to_string())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ObjectStoreError> {
        with_retry("delete_object", key, || async move {
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify("delete_object", e))
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy_object(
        &self,
        bucket: &str,
        from_key: &str,
        to_key: &str,
        options: &PutOptions,
    ) -> Result<(), ObjectStoreError> {
        let source = format!("{}/{}", bucket, encode_key_for_url(from_key));
        let source = source.as_str();
        with_retry("copy_object", to_key, || async move {
            self.client
                .copy_object()
                .bucket(bucket)
                .key(to_key)
                .copy_source(source)
                .set_acl(options.acl.map(canned_acl))
                .send()
                .await
                .map_err(|e| classify("copy_object", e))
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        options: &PutOptions,
    ) -> Result<String, ObjectStoreError> {
        let output = with_retry("create_multipart_upload", key, || async move {
            self.client
                .create_multipart_upload()
                .bucket(bucket)
                .key(key)
                .set_content_type(options.content_type.clone())
                .set_acl(options.acl.map(canned_acl))
                .send()
                .await
                .map_err(|e| classify("create_multipart_upload", e))
        })
        .await?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::Other(format!("no upload id returned for {}", key)))
    }

    #[instrument(skip(self, data), level = "debug", fields(len = data.len()))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<String, ObjectStoreError> {
        let data = &data;
        let output = with_retry("upload_part", key, || async move {
            self.client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data.clone()))
                .send()
                .await
                .map_err(|e| classify("upload_part", e))
        })
        .await?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::Other(format!("no ETag for part {}", part_number)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, ObjectStoreError> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let current = marker.clone();
            let output = with_retry("list_parts", key, || {
                let current = current.clone();
                async move {
                    self.client
                        .list_parts()
                        .bucket(bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .set_part_number_marker(current)
                        .send()
                        .await
                        .map_err(|e| classify("list_parts", e))
                }
            })
            .await?;

            for part in output.parts() {
                if let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) {
                    parts.push(UploadedPart {
                        part_number: number,
                        etag: etag.to_string(),
                        size: part.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            if output.is_truncated().unwrap_or(false) {
                marker = output.next_part_number_marker().map(str::to_string);
                if marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    #[instrument(skip(self, parts), level = "debug", fields(parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ObjectStoreError> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(&p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        with_retry("complete_multipart_upload", key, || {
            let completed = completed.clone();
            async move {
                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(|e| classify("complete_multipart_upload", e))
            }
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError> {
        with_retry("abort_multipart_upload", key, || async move {
            self.client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(|e| classify("abort_multipart_upload", e))
        })
        .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn presign_get(
        &self,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| ObjectStoreError::Other(format!("invalid presign expiry: {}", e)))?;
        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| classify("presign_get", e))?;
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use offload_core::update_document;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::state::ObjectStateStore;

    fn r2_settings() -> ProviderSettings {
        ProviderSettings::new()
            .with("provider", "r2")
            .with("account_id", "acct")
            .with("access_key_id", "AKIA")
            .with("secret_access_key", "secret")
    }

    #[test]
    fn test_from_settings_requires_keys() {
        let variant = ProviderVariant::AmazonS3;
        let result = S3ObjectStore::from_settings(&variant, &ProviderSettings::new());
        assert!(matches!(result, Err(OffloadError::Config(_))));
    }

    #[test]
    fn test_from_settings_builds_client() {
        let settings = r2_settings();
        let variant = ProviderVariant::resolve(&settings).unwrap();
        let store = S3ObjectStore::from_settings(&variant, &settings).unwrap();
        let region = store.client().config().region().map(|r| r.to_string());
        assert_eq!(region.as_deref(), Some("auto"));
    }

    #[tokio::test]
    async fn test_presign_is_local() {
        let settings = r2_settings();
        let variant = ProviderVariant::resolve(&settings).unwrap();
        let store = S3ObjectStore::from_settings(&variant, &settings).unwrap();

        let url = store
            .presign_get("media", "2024/01/a.jpg", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("https://acct.r2.cloudflarestorage.com/media/2024/01/a.jpg"));
        assert!(url.contains("X-Amz-Expires=60"));
    }

    fn minio_store(endpoint: &str) -> S3ObjectStore {
        let settings = ProviderSettings::new()
            .with("provider", "minio")
            .with("endpoint", endpoint)
            .with("access_key_id", "AKIA")
            .with("secret_access_key", "secret");
        let variant = ProviderVariant::resolve(&settings).unwrap();
        S3ObjectStore::from_settings(&variant, &settings).unwrap()
    }

    fn s3_error(status: u16, code: &str) -> ResponseTemplate {
        ResponseTemplate::new(status)
            .insert_header("content-type", "application/xml")
            .set_body_string(format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <Error><Code>{}</Code><Message>{}</Message></Error>",
                code, code
            ))
    }

    #[tokio::test]
    async fn test_conditional_conflict_is_precondition_failure() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/state/jobs.json"))
            .respond_with(s3_error(409, "ConditionalRequestConflict"))
            .mount(&server)
            .await;

        let store = minio_store(&server.uri());
        let result = store
            .put_object_conditional("state", "jobs.json", b"{}".to_vec(), Some("\"v1\""))
            .await;
        assert!(matches!(result, Err(ObjectStoreError::PreconditionFailed(_))));
    }

    #[tokio::test]
    async fn test_state_update_retries_after_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/state/offload/counter.json"))
            .respond_with(s3_error(404, "NoSuchKey"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/state/offload/counter.json"))
            .respond_with(s3_error(409, "ConditionalRequestConflict"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/state/offload/counter.json"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v2\""))
            .expect(1)
            .mount(&server)
            .await;

        let objects: Arc<dyn ObjectStore> = Arc::new(minio_store(&server.uri()));
        let state = ObjectStateStore::new(objects, "state", "offload");
        let value: u32 = update_document(&state, "counter", |n: &mut u32| {
            *n += 1;
            true
        })
        .await
        .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_on_permanent_errors() {
        let mut calls = 0;
        let result: Result<(), _> = with_retry("op", "k", || {
            calls += 1;
            async { Err(ObjectStoreError::AccessDenied("no".into())) }
        })
        .await;
        assert!(matches!(result, Err(ObjectStoreError::AccessDenied(_))));
        assert_eq!(calls, 1);
    }
}
