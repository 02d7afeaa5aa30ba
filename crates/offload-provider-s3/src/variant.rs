use offload_core::{OffloadError, ProviderSettings};

const MIB: u64 = 1024 * 1024;

/// Closed set of S3-compatible services the provider knows how to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderVariant {
    AmazonS3,
    CloudflareR2 { account_id: String },
    DigitalOceanSpaces,
    Minio { endpoint: String },
}

impl ProviderVariant {
    /// Pick the variant named by the `provider` setting.
    ///
    /// `aws` | `r2` | `do` | `minio`. R2 needs `account_id`, MinIO needs `endpoint`.
    pub fn resolve(settings: &ProviderSettings) -> Result<Self, OffloadError> {
        let key = settings.require("provider")?;
        match key {
            "aws" | "s3" => Ok(ProviderVariant::AmazonS3),
            "r2" | "cloudflare" => Ok(ProviderVariant::CloudflareR2 {
                account_id: settings.require("account_id")?.to_string(),
            }),
            "do" | "digitalocean" => Ok(ProviderVariant::DigitalOceanSpaces),
            "minio" => Ok(ProviderVariant::Minio {
                endpoint: settings
                    .require("endpoint")?
                    .trim_end_matches('/')
                    .to_string(),
            }),
            other => Err(OffloadError::Config(format!(
                "unknown storage provider '{}'",
                other
            ))),
        }
    }

    /// Stable key persisted on relationship rows.
    pub fn provider_key(&self) -> &'static str {
        match self {
            ProviderVariant::AmazonS3 => "aws",
            ProviderVariant::CloudflareR2 { .. } => "r2",
            ProviderVariant::DigitalOceanSpaces => "do",
            ProviderVariant::Minio { .. } => "minio",
        }
    }

    pub fn default_region(&self) -> &'static str {
        match self {
            ProviderVariant::AmazonS3 => "us-east-1",
            ProviderVariant::CloudflareR2 { .. } => "auto",
            ProviderVariant::DigitalOceanSpaces => "nyc3",
            ProviderVariant::Minio { .. } => "us-east-1",
        }
    }

    /// Region the request signer uses.
    pub fn signing_region(&self, region: &str) -> String {
        match self {
            ProviderVariant::CloudflareR2 { .. } => "auto".to_string(),
            _ if region.is_empty() => self.default_region().to_string(),
            _ => region.to_string(),
        }
    }

    /// Custom endpoint, `None` for AWS which resolves its own.
    pub fn endpoint(&self, region: &str) -> Option<String> {
        match self {
            ProviderVariant::AmazonS3 => None,
            ProviderVariant::CloudflareR2 { account_id } => {
                Some(format!("https://{}.r2.cloudflarestorage.com", account_id))
            }
            ProviderVariant::DigitalOceanSpaces => Some(format!(
                "https://{}.digitaloceanspaces.com",
                self.signing_region(region)
            )),
            ProviderVariant::Minio { endpoint } => Some(endpoint.clone()),
        }
    }

    pub fn force_path_style(&self) -> bool {
        matches!(
            self,
            ProviderVariant::CloudflareR2 { .. } | ProviderVariant::Minio { .. }
        )
    }

    /// R2 and MinIO ignore canned ACLs; privacy is governed by bucket policy there.
    pub fn supports_acl(&self) -> bool {
        matches!(
            self,
            ProviderVariant::AmazonS3 | ProviderVariant::DigitalOceanSpaces
        )
    }

    /// New AWS buckets block ACLs until ownership controls are relaxed.
    pub fn needs_bucket_defaults(&self) -> bool {
        matches!(self, ProviderVariant::AmazonS3)
    }

    /// Files larger than this go through multipart upload.
    pub fn multipart_threshold(&self) -> u64 {
        match self {
            ProviderVariant::AmazonS3 => 100 * MIB,
            ProviderVariant::CloudflareR2 { .. } => 50 * MIB,
            ProviderVariant::DigitalOceanSpaces => 64 * MIB,
            ProviderVariant::Minio { .. } => 64 * MIB,
        }
    }

    /// Host (and path prefix for path-style variants) of public object URLs.
    ///
    /// `None` for R2: its S3 API host rejects anonymous reads, and the public
    /// `r2.dev` or custom domain cannot be derived from the account.
    pub fn default_domain(&self, bucket: &str, region: &str) -> Option<String> {
        match self {
            ProviderVariant::AmazonS3 => {
                let region = self.signing_region(region);
                Some(if region == "us-east-1" {
                    format!("{}.s3.amazonaws.com", bucket)
                } else {
                    format!("{}.s3.{}.amazonaws.com", bucket, region)
                })
            }
            ProviderVariant::CloudflareR2 { .. } => None,
            ProviderVariant::DigitalOceanSpaces => Some(format!(
                "{}.{}.digitaloceanspaces.com",
                bucket,
                self.signing_region(region)
            )),
            ProviderVariant::Minio { endpoint } => {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://");
                Some(format!("{}/{}", host, bucket))
            }
        }
    }

    /// Whether URLs are served over plain http (local MinIO only).
    pub fn insecure_scheme(&self) -> bool {
        matches!(self, ProviderVariant::Minio { endpoint } if endpoint.starts_with("http://"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_variants() {
        let r2 = ProviderVariant::resolve(
            &ProviderSettings::new()
                .with("provider", "r2")
                .with("account_id", "abc"),
        )
        .unwrap();
        assert_eq!(
            r2,
            ProviderVariant::CloudflareR2 {
                account_id: "abc".into()
            }
        );
        assert_eq!(
            r2.endpoint("ignored").as_deref(),
            Some("https://abc.r2.cloudflarestorage.com")
        );
        assert_eq!(r2.signing_region("eu-west-1"), "auto");
        assert!(!r2.supports_acl());
        assert_eq!(r2.default_domain("media", "auto"), None);

        let missing = ProviderVariant::resolve(&ProviderSettings::new().with("provider", "r2"));
        assert!(matches!(missing, Err(OffloadError::Config(_))));

        let unknown = ProviderVariant::resolve(&ProviderSettings::new().with("provider", "ftp"));
        assert!(unknown.is_err());
    }

    #[test]
    fn test_aws_domain_by_region() {
        let aws = ProviderVariant::AmazonS3;
        assert_eq!(aws.default_domain("media", "").as_deref(), Some("media.s3.amazonaws.com"));
        assert_eq!(
            aws.default_domain("media", "eu-west-1").as_deref(),
            Some("media.s3.eu-west-1.amazonaws.com")
        );
        assert!(aws.endpoint("eu-west-1").is_none());
        assert!(aws.needs_bucket_defaults());
    }

    #[test]
    fn test_minio_path_style_domain() {
        let minio = ProviderVariant::Minio {
            endpoint: "http://localhost:9000".into(),
        };
        assert_eq!(minio.default_domain("media", "").as_deref(), Some("localhost:9000/media"));
        assert!(minio.force_path_style());
        assert!(minio.insecure_scheme());
    }
}
