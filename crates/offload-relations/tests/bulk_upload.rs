//! Backlog migration end to end: catalog -> scheduler -> bulk uploader ->
//! provider -> index, with scheduler state kept in a bucket.

use std::sync::Arc;

use offload_core::{ManualClock, MemoryStateStore, ProviderSettings};
use offload_provider_s3::{MemoryObjectStore, ObjectStateStore, ProviderVariant, S3CompatibleProvider};
use offload_relations::counters::{TOTAL, UPLOADED};
use offload_relations::{
    BulkUploader, DirectoryCatalog, MemoryIndex, RelationshipStore, SourceCatalog, StoreSettings,
    UPLOAD_JOB,
};
use offload_scheduler::{JobScheduler, JobStatus, SchedulerConfig, SliceOutcome};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    objects: Arc<MemoryObjectStore>,
    index: Arc<MemoryIndex>,
    store: Arc<RelationshipStore>,
    uploader: Arc<BulkUploader>,
    scheduler: JobScheduler,
}

async fn harness(files: &[&str]) -> Harness {
    let dir = TempDir::new().unwrap();
    for file in files {
        tokio::fs::write(dir.path().join(file), file.as_bytes())
            .await
            .unwrap();
    }

    let objects = Arc::new(
        MemoryObjectStore::new()
            .with_bucket("media")
            .with_bucket("state"),
    );
    let provider = S3CompatibleProvider::with_store(
        ProviderVariant::CloudflareR2 {
            account_id: "acct".to_string(),
        },
        objects.clone(),
        &ProviderSettings::new()
            .with("bucket", "media")
            .with("public_domain", "media.example.com"),
    )
    .unwrap();

    let clock = Arc::new(ManualClock::default());
    let index = Arc::new(MemoryIndex::new());
    let store = Arc::new(
        RelationshipStore::new(
            Arc::new(provider),
            index.clone(),
            Arc::new(MemoryStateStore::new()),
            StoreSettings::new(dir.path()),
        )
        .with_clock(clock.clone()),
    );

    let catalog: Arc<dyn SourceCatalog> = Arc::new(DirectoryCatalog::new(dir.path(), "file"));
    let uploader = Arc::new(BulkUploader::new(store.clone(), vec![catalog]));

    let scheduler_state = Arc::new(ObjectStateStore::new(objects.clone(), "state", "offload"));
    let mut scheduler = JobScheduler::new(
        scheduler_state,
        clock,
        SchedulerConfig {
            max_per_run: 1,
            ..SchedulerConfig::default()
        },
    );
    scheduler.register(UPLOAD_JOB, uploader.clone());

    Harness {
        _dir: dir,
        objects,
        index,
        store,
        uploader,
        scheduler,
    }
}

#[tokio::test]
async fn test_three_ticks_upload_backlog_then_reset() {
    let h = harness(&["a.jpg", "b.png", "c.pdf"]).await;
    let total = h.uploader.pending_count().await.unwrap();
    assert_eq!(total, 3);
    h.scheduler.start(UPLOAD_JOB, total).await.unwrap();

    for expected_done in 1..=3 {
        let report = h.scheduler.run_all().await.unwrap();
        assert_eq!(
            report.outcome(UPLOAD_JOB),
            Some(&SliceOutcome::Ran {
                processed: 1,
                failed: 0
            })
        );
        assert_eq!(h.index.len().await, expected_done);
    }

    let snapshot = h.scheduler.status(UPLOAD_JOB).await.unwrap();
    assert!(snapshot.completed);
    assert_eq!(snapshot.percentage, 100);
    assert_eq!(snapshot.label(), "completed");

    let after = h.scheduler.status(UPLOAD_JOB).await.unwrap();
    assert!(!after.completed);
    assert_eq!(after.total, 0);
    assert_eq!(after.status, JobStatus::Stopped);

    for key in ["a.jpg", "b.png", "c.pdf"] {
        assert!(h.objects.contains("media", key));
    }
    let row = h.store.get("b.png", "file").await.unwrap();
    assert_eq!(row.provider, "r2");
    assert_eq!(row.url, "https://media.example.com/b.png");

    let counters = h
        .store
        .counters()
        .fetch_and_update(h.index.as_ref(), h.store.scope(), h.uploader.catalogs())
        .await
        .unwrap();
    assert_eq!(counters["file"][UPLOADED], 3);
    assert_eq!(counters["file"][TOTAL], 3);
    assert_eq!(h.uploader.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_pause_before_first_tick_then_resume() {
    let files = ["1.jpg", "2.jpg", "3.jpg", "4.jpg", "5.jpg"];
    let h = harness(&files).await;
    h.scheduler.start(UPLOAD_JOB, 5).await.unwrap();
    h.scheduler.pause(UPLOAD_JOB).await.unwrap();

    h.scheduler.run_all().await.unwrap();
    let paused = h.scheduler.status(UPLOAD_JOB).await.unwrap();
    assert_eq!(paused.done, 0);
    assert_eq!(paused.status, JobStatus::Paused);
    assert!(!paused.pause_requested);
    assert!(h.index.is_empty().await);

    h.scheduler.resume(UPLOAD_JOB).await.unwrap();
    for _ in 0..5 {
        h.scheduler.run_all().await.unwrap();
    }
    let done = h.scheduler.status(UPLOAD_JOB).await.unwrap();
    assert!(done.completed);
    assert_eq!(done.done, 5);
    assert_eq!(h.index.len().await, 5);
}

#[tokio::test]
async fn test_deleting_a_synced_item_makes_it_pending_again() {
    let h = harness(&["a.jpg"]).await;
    h.scheduler.start(UPLOAD_JOB, 1).await.unwrap();
    h.scheduler.run_all().await.unwrap();
    assert!(h.objects.contains("media", "a.jpg"));

    assert!(h.store.delete("a.jpg", "file").await);
    assert!(!h.objects.contains("media", "a.jpg"));
    assert_eq!(h.uploader.pending_count().await.unwrap(), 1);
}
