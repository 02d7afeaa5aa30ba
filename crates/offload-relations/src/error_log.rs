use std::collections::BTreeMap;
use std::sync::Arc;

use offload_core::{read_document, update_document, Clock, OffloadError, StateStore};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Last failure recorded for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: u16,
    pub message: String,
    /// Epoch seconds.
    pub time: i64,
}

/// Per-item upload failures, one document per source type (`errors/{type}`).
///
/// Items with an entry are skipped by the bulk uploader until the entry is
/// cleared by a successful sync or a delete.
pub struct ErrorLog {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl ErrorLog {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn key(source_type: &str) -> String {
        format!("errors/{}", urlencoding::encode(source_type))
    }

    pub async fn record(
        &self,
        source_type: &str,
        source_id: &str,
        code: u16,
        message: &str,
    ) -> Result<(), OffloadError> {
        warn!(source_type, source_id, code, message, "item failed");
        let entry = ErrorEntry {
            code,
            message: message.to_string(),
            time: self.clock.epoch_secs(),
        };
        update_document(
            self.store.as_ref(),
            &Self::key(source_type),
            |entries: &mut BTreeMap<String, ErrorEntry>| {
                entries.insert(source_id.to_string(), entry.clone());
                true
            },
        )
        .await?;
        Ok(())
    }

    pub async fn clear(&self, source_type: &str, source_id: &str) -> Result<(), OffloadError> {
        update_document(
            self.store.as_ref(),
            &Self::key(source_type),
            |entries: &mut BTreeMap<String, ErrorEntry>| entries.remove(source_id).is_some(),
        )
        .await?;
        Ok(())
    }

    pub async fn get(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> Result<Option<ErrorEntry>, OffloadError> {
        Ok(self.entries(source_type).await?.remove(source_id))
    }

    pub async fn entries(
        &self,
        source_type: &str,
    ) -> Result<BTreeMap<String, ErrorEntry>, OffloadError> {
        read_document(self.store.as_ref(), &Self::key(source_type)).await
    }
}
