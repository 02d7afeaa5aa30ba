use std::sync::Arc;

use offload_core::{
    read_document, update_document, OffloadError, ProviderScope, Relationship, StateStore,
};
use serde::{Deserialize, Serialize};

/// Per-source metadata persisted next to the source itself.
///
/// Survives process restarts, unlike the in-memory cache, and also carries
/// the object-versioning prefix of an upload generation in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceMeta {
    pub relationship: Option<Relationship>,
    /// Set when the index was consulted and had no row.
    pub missing: bool,
    pub object_version: Option<String>,
}

/// Metadata documents in a `StateStore`, one per (scope, source_type, source_id).
pub struct SourceMetaCache {
    store: Arc<dyn StateStore>,
    prefix: String,
}

impl SourceMetaCache {
    pub fn new(store: Arc<dyn StateStore>, scope: &ProviderScope) -> Self {
        Self {
            store,
            prefix: format!(
                "meta/{}/{}",
                urlencoding::encode(&scope.provider),
                urlencoding::encode(&scope.bucket)
            ),
        }
    }

    fn key(&self, source_id: &str, source_type: &str) -> String {
        format!(
            "{}/{}/{}",
            self.prefix,
            urlencoding::encode(source_type),
            urlencoding::encode(source_id)
        )
    }

    pub async fn load(
        &self,
        source_id: &str,
        source_type: &str,
    ) -> Result<Option<SourceMeta>, OffloadError> {
        match self.store.load(&self.key(source_id, source_type)).await? {
            Some(versioned) => Ok(Some(serde_json::from_slice(&versioned.data)?)),
            None => Ok(None),
        }
    }

    pub async fn store_relationship(&self, row: &Relationship) -> Result<(), OffloadError> {
        update_document(
            self.store.as_ref(),
            &self.key(&row.source_id, &row.source_type),
            |meta: &mut SourceMeta| {
                meta.relationship = Some(row.clone());
                meta.missing = false;
                true
            },
        )
        .await?;
        Ok(())
    }

    pub async fn store_missing(&self, source_id: &str, source_type: &str) -> Result<(), OffloadError> {
        update_document(
            self.store.as_ref(),
            &self.key(source_id, source_type),
            |meta: &mut SourceMeta| {
                meta.relationship = None;
                meta.missing = true;
                true
            },
        )
        .await?;
        Ok(())
    }

    /// Drop the cached row and negative marker, keeping the version prefix.
    pub async fn invalidate(&self, source_id: &str, source_type: &str) -> Result<(), OffloadError> {
        update_document(
            self.store.as_ref(),
            &self.key(source_id, source_type),
            |meta: &mut SourceMeta| {
                if meta.relationship.is_none() && !meta.missing {
                    return false;
                }
                meta.relationship = None;
                meta.missing = false;
                true
            },
        )
        .await?;
        Ok(())
    }

    pub async fn object_version(
        &self,
        source_id: &str,
        source_type: &str,
    ) -> Result<Option<String>, OffloadError> {
        let meta: SourceMeta =
            read_document(self.store.as_ref(), &self.key(source_id, source_type)).await?;
        Ok(meta.object_version)
    }

    pub async fn set_object_version(
        &self,
        source_id: &str,
        source_type: &str,
        version: Option<String>,
    ) -> Result<(), OffloadError> {
        update_document(
            self.store.as_ref(),
            &self.key(source_id, source_type),
            |meta: &mut SourceMeta| {
                if meta.object_version == version {
                    return false;
                }
                meta.object_version = version.clone();
                true
            },
        )
        .await?;
        Ok(())
    }

    /// Remove the whole document.
    pub async fn forget(&self, source_id: &str, source_type: &str) -> Result<(), OffloadError> {
        self.store.remove(&self.key(source_id, source_type)).await
    }
}
