use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use offload_core::ProviderSettings;
use offload_relations::{CacheConfig, D1Config, StoreSettings};
use offload_scheduler::SchedulerConfig;

/// Configuration for the offload worker.
#[derive(Parser, Debug, Clone)]
#[command(name = "offload-worker")]
#[command(about = "Offloads local files to S3-compatible object storage")]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Storage provider: aws, r2, do or minio
    #[arg(long, default_value = "aws", env = "OFFLOAD_PROVIDER")]
    pub provider: String,

    /// Bucket objects are offloaded to
    #[arg(long, env = "OFFLOAD_BUCKET")]
    pub bucket: String,

    /// Bucket region (provider default when omitted)
    #[arg(long, env = "OFFLOAD_REGION")]
    pub region: Option<String>,

    #[arg(long, env = "OFFLOAD_ACCESS_KEY_ID")]
    pub access_key_id: String,

    #[arg(long, env = "OFFLOAD_SECRET_ACCESS_KEY")]
    pub secret_access_key: String,

    /// Cloudflare account ID (R2, and D1 unless --d1-account-id is set)
    #[arg(long, env = "CLOUDFLARE_ACCOUNT_ID")]
    pub cloudflare_account_id: Option<String>,

    /// Endpoint URL (MinIO)
    #[arg(long, env = "OFFLOAD_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Domain used in public URLs instead of the provider's own (required for R2)
    #[arg(long, env = "OFFLOAD_PUBLIC_DOMAIN")]
    pub public_domain: Option<String>,

    /// Default lifetime of signed URLs, in seconds
    #[arg(long, env = "OFFLOAD_PRIVATE_URL_EXPIRY_SECS")]
    pub private_url_expiry_secs: Option<u64>,

    /// Directory whose files are offloaded
    #[arg(long, env = "OFFLOAD_SOURCE_DIR")]
    pub source_dir: PathBuf,

    /// Source type recorded for files of --source-dir
    #[arg(long, default_value = "file", env = "OFFLOAD_SOURCE_TYPE")]
    pub source_type: String,

    /// Key prefix for every upload
    #[arg(long, default_value = "", env = "OFFLOAD_KEY_PREFIX")]
    pub key_prefix: String,

    /// Insert a timestamp segment into object keys
    #[arg(long, env = "OFFLOAD_OBJECT_VERSIONING")]
    pub object_versioning: bool,

    /// Delete local files once offloaded
    #[arg(long, env = "OFFLOAD_REMOVE_LOCAL_FILES")]
    pub remove_local_files: bool,

    /// Upload every file with a private ACL
    #[arg(long, env = "OFFLOAD_PRIVATE")]
    pub private: bool,

    /// Bucket holding scheduler and metadata documents (defaults to --bucket)
    #[arg(long, env = "OFFLOAD_STATE_BUCKET")]
    pub state_bucket: Option<String>,

    /// Key prefix of scheduler and metadata documents
    #[arg(long, default_value = "offload-state", env = "OFFLOAD_STATE_PREFIX")]
    pub state_prefix: String,

    /// D1 database holding the relationship index
    #[arg(long, env = "D1_DATABASE_ID")]
    pub d1_database_id: String,

    #[arg(long, env = "D1_API_TOKEN")]
    pub d1_api_token: String,

    /// Account of the D1 database (defaults to --cloudflare-account-id)
    #[arg(long, env = "D1_ACCOUNT_ID")]
    pub d1_account_id: Option<String>,

    /// Seconds a scheduler slice holds its job lock
    #[arg(long, default_value = "300", env = "OFFLOAD_LOCK_SECS")]
    pub lock_secs: u64,

    /// Iteration cap per slice
    #[arg(long, default_value = "50", env = "OFFLOAD_MAX_PER_RUN")]
    pub max_per_run: u32,

    /// Execution time limit of the host invocation, in seconds
    #[arg(long, env = "OFFLOAD_TIME_LIMIT_SECS")]
    pub time_limit_secs: Option<u64>,

    /// Memory limit of the host invocation, in MiB
    #[arg(long, env = "OFFLOAD_MEMORY_LIMIT_MB")]
    pub memory_limit_mb: Option<u64>,

    /// Relationship cache TTL, in seconds
    #[arg(long, default_value = "300", env = "OFFLOAD_CACHE_TTL_SECS")]
    pub cache_ttl_secs: u64,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run one scheduler slice for every running job (call once a minute)
    Tick,
    /// Start the upload job over the current backlog
    Start,
    /// Print every job's status
    Status,
    Pause,
    Resume,
    Stop,
    /// Create the index schema and recompute progress counters
    Reconcile,
    /// Check credentials, bucket and object permissions
    Verify,
}

impl Config {
    /// Opaque settings map handed to the provider.
    pub fn provider_settings(&self) -> ProviderSettings {
        let mut settings = ProviderSettings::new()
            .with("provider", self.provider.as_str())
            .with("bucket", self.bucket.as_str())
            .with("access_key_id", self.access_key_id.as_str())
            .with("secret_access_key", self.secret_access_key.as_str());

        let optional = [
            ("region", &self.region),
            ("account_id", &self.cloudflare_account_id),
            ("endpoint", &self.endpoint),
            ("public_domain", &self.public_domain),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                settings = settings.with(key, value.as_str());
            }
        }
        if let Some(expiry) = self.private_url_expiry_secs {
            settings = settings.with("private_url_expiry_secs", expiry);
        }
        settings
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            base_dir: self.source_dir.clone(),
            prefix: self.key_prefix.clone(),
            object_versioning: self.object_versioning,
            remove_local_files: self.remove_local_files,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            lock_duration: Duration::from_secs(self.lock_secs),
            max_per_run: self.max_per_run,
            ..SchedulerConfig::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::with_ttl(Duration::from_secs(self.cache_ttl_secs))
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(Duration::from_secs)
    }

    pub fn memory_limit(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb * 1024 * 1024)
    }

    pub fn state_bucket(&self) -> &str {
        self.state_bucket.as_deref().unwrap_or(&self.bucket)
    }

    pub fn d1_config(&self) -> anyhow::Result<D1Config> {
        let account_id = self
            .d1_account_id
            .as_ref()
            .or(self.cloudflare_account_id.as_ref())
            .ok_or_else(|| anyhow::anyhow!("--d1-account-id or --cloudflare-account-id is required"))?;
        Ok(D1Config::new(
            account_id.clone(),
            self.d1_api_token.clone(),
            self.d1_database_id.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let mut args = vec![
            "offload-worker",
            "--bucket",
            "media",
            "--access-key-id",
            "key",
            "--secret-access-key",
            "secret",
            "--source-dir",
            "/srv/uploads",
            "--d1-database-id",
            "db",
            "--d1-api-token",
            "token",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["tick"]);
        assert_eq!(config.command, Command::Tick);
        assert_eq!(config.provider, "aws");
        assert_eq!(config.state_bucket(), "media");
        assert!(!config.object_versioning);

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.lock_duration, Duration::from_secs(300));
        assert_eq!(scheduler.max_per_run, 50);

        let settings = config.provider_settings();
        assert_eq!(settings.string("bucket"), Some("media"));
        assert_eq!(settings.string("region"), None);
        assert!(config.d1_config().is_err());
    }

    #[test]
    fn test_r2_settings() {
        let config = parse(&[
            "--provider",
            "r2",
            "--cloudflare-account-id",
            "acct",
            "--private-url-expiry-secs",
            "60",
            "--object-versioning",
            "--memory-limit-mb",
            "256",
            "status",
        ]);
        let settings = config.provider_settings();
        assert_eq!(settings.string("account_id"), Some("acct"));
        assert_eq!(settings.u64("private_url_expiry_secs"), Some(60));
        assert!(config.store_settings().object_versioning);
        assert_eq!(config.memory_limit(), Some(256 * 1024 * 1024));
        assert_eq!(config.d1_config().unwrap().account_id, "acct");
    }
}
