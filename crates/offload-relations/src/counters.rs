use std::collections::BTreeMap;
use std::sync::Arc;

use offload_core::{read_document, update_document, OffloadError, ProviderScope, StateStore};
use tracing::{debug, warn};

use crate::catalog::SourceCatalog;
use crate::index::RelationshipIndex;

/// Rows written for a source type.
pub const UPLOADED: &str = "uploaded";
/// Sources known to the catalog for a source type.
pub const TOTAL: &str = "total";

/// source_type -> property -> value
pub type CounterTable = BTreeMap<String, BTreeMap<String, u64>>;

/// Progress counters for one backend scope, kept in a single document.
pub struct ProgressCounters {
    store: Arc<dyn StateStore>,
    key: String,
}

impl ProgressCounters {
    pub fn new(store: Arc<dyn StateStore>, scope: &ProviderScope) -> Self {
        Self {
            store,
            key: format!(
                "counters/{}/{}",
                urlencoding::encode(&scope.provider),
                urlencoding::encode(&scope.bucket)
            ),
        }
    }

    async fn modify(
        &self,
        source_type: &str,
        property: &str,
        apply: impl Fn(u64) -> u64,
    ) -> Result<u64, OffloadError> {
        let table = update_document(self.store.as_ref(), &self.key, |table: &mut CounterTable| {
            let value = table
                .entry(source_type.to_string())
                .or_default()
                .entry(property.to_string())
                .or_insert(0);
            let next = apply(*value);
            let changed = next != *value;
            *value = next;
            changed
        })
        .await?;
        Ok(lookup(&table, source_type, property))
    }

    pub async fn add(&self, source_type: &str, property: &str, by: u64) -> Result<u64, OffloadError> {
        self.modify(source_type, property, |v| v.saturating_add(by)).await
    }

    /// Decrement, never below zero.
    pub async fn remove(&self, source_type: &str, property: &str, by: u64) -> Result<u64, OffloadError> {
        self.modify(source_type, property, |v| v.saturating_sub(by)).await
    }

    pub async fn update(&self, source_type: &str, property: &str, value: u64) -> Result<u64, OffloadError> {
        self.modify(source_type, property, |_| value).await
    }

    pub async fn get(&self, source_type: &str, property: &str) -> Result<u64, OffloadError> {
        let table: CounterTable = read_document(self.store.as_ref(), &self.key).await?;
        Ok(lookup(&table, source_type, property))
    }

    pub async fn all(&self) -> Result<CounterTable, OffloadError> {
        read_document(self.store.as_ref(), &self.key).await
    }

    /// Recompute `uploaded` from the index and `total` from each catalog.
    ///
    /// A catalog whose count fails keeps its previous total.
    pub async fn fetch_and_update(
        &self,
        index: &dyn RelationshipIndex,
        scope: &ProviderScope,
        catalogs: &[Arc<dyn SourceCatalog>],
    ) -> Result<CounterTable, OffloadError> {
        let uploaded = index.count_by_source_type(scope).await?;

        let mut totals = BTreeMap::new();
        for catalog in catalogs {
            match catalog.total_count().await {
                Ok(total) => {
                    totals.insert(catalog.source_type().to_string(), total);
                }
                Err(e) => warn!(source_type = catalog.source_type(), error = %e, "total count failed"),
            }
        }

        let table = update_document(self.store.as_ref(), &self.key, |table: &mut CounterTable| {
            for counters in table.values_mut() {
                counters.insert(UPLOADED.to_string(), 0);
            }
            for (source_type, count) in &uploaded {
                table
                    .entry(source_type.clone())
                    .or_default()
                    .insert(UPLOADED.to_string(), *count);
            }
            for (source_type, total) in &totals {
                table
                    .entry(source_type.clone())
                    .or_default()
                    .insert(TOTAL.to_string(), *total);
            }
            true
        })
        .await?;

        debug!(?table, "counters reconciled");
        Ok(table)
    }
}

fn lookup(table: &CounterTable, source_type: &str, property: &str) -> u64 {
    table
        .get(source_type)
        .and_then(|counters| counters.get(property))
        .copied()
        .unwrap_or(0)
}
