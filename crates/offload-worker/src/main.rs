mod config;

use std::sync::Arc;

use clap::Parser;
use offload_core::{BucketConfig, Provider, StateStore, SystemClock};
use offload_provider_s3::{ObjectStateStore, S3CompatibleProvider};
use offload_relations::{
    BulkUploader, D1Index, DirectoryCatalog, RelationshipStore, SourceCatalog, UPLOAD_JOB,
};
use offload_scheduler::{JobScheduler, ProcessEnvironment, SliceOutcome};
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();

    info!(
        "Starting offload-worker ({:?}) for {} bucket {}",
        config.command, config.provider, config.bucket
    );

    let s3 = S3CompatibleProvider::from_settings(&config.provider_settings())?;
    let state: Arc<dyn StateStore> = Arc::new(ObjectStateStore::new(
        s3.store().clone(),
        config.state_bucket(),
        &config.state_prefix,
    ));
    let provider: Arc<dyn Provider> = Arc::new(s3);

    if config.command == Command::Verify {
        return verify(provider.as_ref()).await;
    }

    let index = Arc::new(D1Index::new(config.d1_config()?));
    let store = Arc::new(
        RelationshipStore::new(provider, index.clone(), state.clone(), config.store_settings())
            .with_cache_config(config.cache_config()),
    );
    let catalog: Arc<dyn SourceCatalog> = Arc::new(
        DirectoryCatalog::new(config.source_dir.clone(), config.source_type.as_str())
            .private(config.private),
    );
    let uploader = Arc::new(BulkUploader::new(store.clone(), vec![catalog]));

    let mut scheduler = JobScheduler::new(state, Arc::new(SystemClock), config.scheduler_config())
        .with_environment(Arc::new(ProcessEnvironment::new(
            config.time_limit(),
            config.memory_limit(),
        )))
        .with_shutdown(create_shutdown_signal());
    scheduler.register(UPLOAD_JOB, uploader.clone());

    match config.command {
        Command::Tick => {
            let report = scheduler.run_all().await?;
            for (job_type, outcome) in &report.outcomes {
                match outcome {
                    SliceOutcome::Ran { processed, failed } => {
                        info!(job_type = %job_type, processed, failed, "slice finished")
                    }
                    SliceOutcome::Error(message) => {
                        warn!(job_type = %job_type, message = %message, "slice failed")
                    }
                    other => info!(job_type = %job_type, outcome = ?other, "slice skipped"),
                }
            }
            print_json(&scheduler.peek_all().await?)?;
        }
        Command::Start => {
            index.ensure_schema().await?;
            let total = uploader.pending_count().await?;
            let snapshot = scheduler.start(UPLOAD_JOB, total).await?;
            info!("Upload job started with {} pending items", total);
            print_json(&snapshot)?;
        }
        Command::Status => {
            let jobs = scheduler.all_statuses().await?;
            let counters = store.counters().all().await?;
            print_json(&json!({ "jobs": jobs, "counters": counters }))?;
        }
        Command::Pause => {
            scheduler.pause(UPLOAD_JOB).await?;
            print_json(&scheduler.peek(UPLOAD_JOB).await?)?;
        }
        Command::Resume => {
            scheduler.resume(UPLOAD_JOB).await?;
            print_json(&scheduler.peek(UPLOAD_JOB).await?)?;
        }
        Command::Stop => {
            scheduler.stop(UPLOAD_JOB).await?;
            print_json(&scheduler.peek(UPLOAD_JOB).await?)?;
        }
        Command::Reconcile => {
            index.ensure_schema().await?;
            let counters = store
                .counters()
                .fetch_and_update(index.as_ref(), store.scope(), uploader.catalogs())
                .await?;
            print_json(&counters)?;
        }
        // Verify returns before the index is configured.
        Command::Verify => {}
    }

    Ok(())
}

/// Credential, bucket and object permission checks against the configured bucket.
async fn verify(provider: &dyn Provider) -> anyhow::Result<()> {
    let credentials = provider.verify_credentials().await;
    let bucket = BucketConfig {
        name: provider.bucket().to_string(),
        region: Some(provider.region().to_string()),
    };
    let bucket_exists = provider.verify_bucket_exists(&bucket).await;
    let write = provider.verify_object_write_permission().await;
    let read = provider.verify_object_read_permission().await;
    let delete = provider.verify_object_delete_permission().await;

    let passed = credentials.success
        && bucket_exists.success
        && write.success
        && read.success
        && delete.success;

    print_json(&json!({
        "provider": provider.provider_key(),
        "credentials": credentials,
        "bucket": bucket_exists,
        "write": write,
        "read": read,
        "delete": delete,
    }))?;

    if !passed {
        anyhow::bail!("verification failed for bucket {}", provider.bucket());
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Flips to `true` on Ctrl+C or SIGTERM so a running slice stops between
/// iterations and releases its lock.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received, finishing current iteration");
        let _ = tx.send(true);
    });

    rx
}
