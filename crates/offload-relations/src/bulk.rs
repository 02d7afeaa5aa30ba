use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use offload_core::OffloadError;
use offload_scheduler::JobHandler;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::catalog::{SourceCatalog, SourceItem};
use crate::store::RelationshipStore;

/// Job type the bulk uploader is registered under.
pub const UPLOAD_JOB: &str = "upload";

/// Scheduler handler that offloads one pending source per iteration.
///
/// Pending means known to a catalog, without a relationship row and without
/// an error log entry. Failed items therefore never block the backlog.
///
/// The backlog is listed once into a queue and drained one item per
/// iteration; it is listed again only when the queue runs dry.
pub struct BulkUploader {
    store: Arc<RelationshipStore>,
    catalogs: Vec<Arc<dyn SourceCatalog>>,
    queue: Mutex<VecDeque<SourceItem>>,
}

impl BulkUploader {
    pub fn new(store: Arc<RelationshipStore>, catalogs: Vec<Arc<dyn SourceCatalog>>) -> Self {
        Self {
            store,
            catalogs,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn store(&self) -> &Arc<RelationshipStore> {
        &self.store
    }

    pub fn catalogs(&self) -> &[Arc<dyn SourceCatalog>] {
        &self.catalogs
    }

    async fn pending_in(&self, catalog: &dyn SourceCatalog) -> Result<Vec<SourceItem>, OffloadError> {
        let source_type = catalog.source_type();
        let synced = self
            .store
            .index()
            .source_ids(self.store.scope(), source_type)
            .await?;
        let failed = self.store.errors().entries(source_type).await?;

        Ok(catalog
            .list()
            .await?
            .into_iter()
            .filter(|item| !synced.contains(&item.source_id) && !failed.contains_key(&item.source_id))
            .collect())
    }

    /// Every pending source, catalog by catalog.
    pub async fn pending(&self) -> Result<Vec<SourceItem>, OffloadError> {
        let mut pending = Vec::new();
        for catalog in &self.catalogs {
            pending.extend(self.pending_in(catalog.as_ref()).await?);
        }
        Ok(pending)
    }

    pub async fn pending_count(&self) -> Result<u64, OffloadError> {
        Ok(self.pending().await?.len() as u64)
    }

    async fn next_pending(&self) -> Result<Option<SourceItem>, OffloadError> {
        let mut queue = self.queue.lock().await;
        let mut refilled = false;
        loop {
            while let Some(item) = queue.pop_front() {
                if self.still_pending(&item).await? {
                    return Ok(Some(item));
                }
                debug!(source_id = %item.source_id, "queued item handled elsewhere, skipping");
            }
            if refilled {
                return Ok(None);
            }
            queue.extend(self.pending().await?);
            refilled = true;
        }
    }

    /// Single-row re-check of a queued item.
    async fn still_pending(&self, item: &SourceItem) -> Result<bool, OffloadError> {
        if self.store.lookup(&item.source_id, &item.source_type).await.is_some() {
            return Ok(false);
        }
        let failed = self
            .store
            .errors()
            .get(&item.source_type, &item.source_id)
            .await?;
        Ok(failed.is_none())
    }
}

#[async_trait]
impl JobHandler for BulkUploader {
    #[instrument(skip(self), level = "debug")]
    async fn run_iteration(&self, job_type: &str) -> anyhow::Result<bool> {
        let Some(item) = self.next_pending().await? else {
            debug!("nothing left to upload");
            return Ok(true);
        };
        Ok(self.store.sync_source(&item).await.is_success())
    }
}
