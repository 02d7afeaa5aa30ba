use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use offload_core::{
    codes, object_version, BackupPolicy, DerivedObject, NewRelationship, OffloadError,
    Relationship, RelationshipExtra, RelationshipUpdate, UploadedObject,
};
use tracing::{info, instrument, warn};

use crate::catalog::SourceItem;
use crate::store::RelationshipStore;

/// Result of syncing one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Added(Relationship),
    Updated(Relationship),
    /// Recorded in the error log; the item is skipped until it is cleared.
    Failed { code: u16, message: String },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, SyncOutcome::Failed { .. })
    }

    pub fn relationship(&self) -> Option<&Relationship> {
        match self {
            SyncOutcome::Added(row) | SyncOutcome::Updated(row) => Some(row),
            SyncOutcome::Failed { .. } => None,
        }
    }
}

type UploadFailure = (u16, String);

/// `{len}:{mtime_ms}` of a local file, `None` when it cannot be read.
async fn source_fingerprint(path: &Path) -> Option<String> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or_default();
    Some(format!("{}:{}", metadata.len(), modified))
}

fn versioned_prefix(base: &str, version: Option<&str>) -> String {
    [base, version.unwrap_or("")]
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl RelationshipStore {
    /// Upload a source with its original and derived sizes, then record it.
    ///
    /// A new key displaces the previous location into the backup slot, so the
    /// old objects keep serving until they are cleaned up. Re-running a sync
    /// that failed halfway reuses the same version prefix and skips the
    /// objects already uploaded; so does re-syncing an unchanged source.
    #[instrument(skip(self, item), fields(source_id = %item.source_id, source_type = %item.source_type))]
    pub async fn sync_source(&self, item: &SourceItem) -> SyncOutcome {
        let previous = self.lookup(&item.source_id, &item.source_type).await;
        let fingerprint = match self.local_path(&item.source_path) {
            Some(path) => source_fingerprint(&path).await,
            None => None,
        };

        let version = match self
            .upload_generation(item, previous.as_ref(), fingerprint.as_deref())
            .await
        {
            Ok(version) => version,
            Err(e) => return self.fail(item, codes::UPLOAD_FAILED, e.to_string()).await,
        };
        let prefix = versioned_prefix(&self.settings.prefix, version.as_deref());

        let current = match self.upload(item, &item.source_path, &prefix).await {
            Ok(uploaded) => uploaded,
            Err((code, message)) => return self.fail(item, code, message).await,
        };

        let (original_source_path, original_key) = match &item.original_source_path {
            Some(original) if original != &item.source_path => {
                match self.upload(item, original, &prefix).await {
                    Ok(uploaded) => (original.clone(), uploaded.key),
                    Err((code, message)) => return self.fail(item, code, message).await,
                }
            }
            _ => (item.source_path.clone(), current.key.clone()),
        };

        let mut sizes = BTreeMap::new();
        for (name, size) in &item.sizes {
            match self.upload(item, &size.source_path, &prefix).await {
                Ok(uploaded) => {
                    sizes.insert(
                        name.clone(),
                        DerivedObject {
                            source_path: size.source_path.clone(),
                            url: uploaded.file_url,
                            key: uploaded.key,
                            width: size.width,
                            height: size.height,
                        },
                    );
                }
                Err((code, message)) => return self.fail(item, code, message).await,
            }
        }

        let extra = RelationshipExtra {
            width: item.width,
            height: item.height,
            object_version: version,
            source_fingerprint: fingerprint,
            sizes,
            backup: None,
        };

        let outcome = match previous {
            None => {
                let new = NewRelationship {
                    source_id: item.source_id.clone(),
                    source_type: item.source_type.clone(),
                    url: current.file_url,
                    key: current.key,
                    source_path: item.source_path.clone(),
                    original_source_path,
                    original_key,
                    extra,
                    is_private: item.is_private,
                };
                if self.add(new).await.is_none() {
                    return self
                        .fail(item, codes::UPLOAD_FAILED, "relationship could not be stored")
                        .await;
                }
                match self.lookup(&item.source_id, &item.source_type).await {
                    Some(row) => SyncOutcome::Added(row),
                    None => {
                        return self
                            .fail(item, codes::UPLOAD_FAILED, "relationship vanished after insert")
                            .await
                    }
                }
            }
            Some(previous) => {
                let backup = if previous.key != current.key {
                    BackupPolicy::Displace
                } else {
                    BackupPolicy::Keep
                };
                let update = RelationshipUpdate {
                    source_path: Some(item.source_path.clone()),
                    url: Some(current.file_url),
                    key: Some(current.key),
                    original_source_path: Some(original_source_path),
                    original_key: Some(original_key),
                    is_private: Some(item.is_private),
                    extra: Some(extra),
                    backup,
                };
                match self
                    .update(&item.source_id, update, &item.source_type)
                    .await
                {
                    Some(row) => SyncOutcome::Updated(row),
                    None => {
                        return self
                            .fail(item, codes::UPLOAD_FAILED, "relationship could not be updated")
                            .await
                    }
                }
            }
        };

        if let Err(e) = self.errors.clear(&item.source_type, &item.source_id).await {
            warn!(error = %e, "error log entry not cleared");
        }
        if let Err(e) = self
            .meta
            .set_object_version(&item.source_id, &item.source_type, None)
            .await
        {
            warn!(error = %e, "version prefix not released");
        }
        if let Some(row) = outcome.relationship() {
            info!(key = %row.key, "source synced");
            self.purge_item_local_files(row).await;
        }
        outcome
    }

    /// Version segment for this upload generation.
    ///
    /// Generated once and cached until the sync completes, so a retried sync
    /// produces the same keys. A synced row keeps its segment while the
    /// source path and fingerprint are unchanged.
    async fn upload_generation(
        &self,
        item: &SourceItem,
        previous: Option<&Relationship>,
        fingerprint: Option<&str>,
    ) -> Result<Option<String>, OffloadError> {
        if !self.settings.object_versioning {
            return Ok(None);
        }
        if let Some(version) = self
            .meta
            .object_version(&item.source_id, &item.source_type)
            .await?
        {
            return Ok(Some(version));
        }
        if let Some(row) = previous {
            let unchanged = row.source_path == item.source_path
                && fingerprint.is_some()
                && row.extra.source_fingerprint.as_deref() == fingerprint;
            if let (true, Some(version)) = (unchanged, &row.extra.object_version) {
                return Ok(Some(version.clone()));
            }
        }

        let version = object_version(self.clock.now());
        self.meta
            .set_object_version(&item.source_id, &item.source_type, Some(version.clone()))
            .await?;
        Ok(Some(version))
    }

    async fn upload(
        &self,
        item: &SourceItem,
        relative_path: &str,
        prefix: &str,
    ) -> Result<UploadedObject, UploadFailure> {
        let Some(absolute) = self.local_path(relative_path) else {
            return Err((
                codes::UNSUPPORTED,
                format!("{} is outside the base directory", relative_path),
            ));
        };

        let result = self
            .provider
            .upload_single(&absolute, relative_path, prefix, item.is_private)
            .await;
        if !result.success {
            return Err((result.code, result.message));
        }
        result
            .data
            .ok_or_else(|| (codes::UPLOAD_FAILED, "provider returned no object".to_string()))
    }

    async fn fail(&self, item: &SourceItem, code: u16, message: impl Into<String>) -> SyncOutcome {
        let message = message.into();
        if let Err(e) = self
            .errors
            .record(&item.source_type, &item.source_id, code, &message)
            .await
        {
            warn!(error = %e, "error log entry not recorded");
        }
        SyncOutcome::Failed { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::catalog::{DirectoryCatalog, SourceCatalog, SourceSize};
    use crate::test_support::Fixture;

    async fn catalog_item(f: &Fixture, source_id: &str) -> SourceItem {
        DirectoryCatalog::new(f.dir.path(), "file")
            .item(source_id)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_versioned_prefix() {
        assert_eq!(versioned_prefix("uploads/", Some("20240101000000")), "uploads/20240101000000");
        assert_eq!(versioned_prefix("", Some("20240101000000")), "20240101000000");
        assert_eq!(versioned_prefix("/uploads/", None), "uploads");
        assert_eq!(versioned_prefix("", None), "");
    }

    #[tokio::test]
    async fn test_sync_uploads_original_and_sizes() {
        let f = Fixture::new(|s| s.prefix = "uploads/".into());
        f.write("2024/cat.jpg", b"original").await;
        f.write("2024/cat-scaled.jpg", b"scaled").await;
        f.write("2024/cat-150x150.jpg", b"thumb").await;
        let item = catalog_item(&f, "2024/cat.jpg").await;

        let SyncOutcome::Added(row) = f.store.sync_source(&item).await else {
            panic!("expected a new relationship");
        };
        assert_eq!(row.key, "uploads/2024/cat-scaled.jpg");
        assert_eq!(row.source_path, "2024/cat-scaled.jpg");
        assert_eq!(row.original_key, "uploads/2024/cat.jpg");
        assert_eq!(row.original_source_path, "2024/cat.jpg");
        assert_eq!(row.extra.sizes["150x150"].key, "uploads/2024/cat-150x150.jpg");
        assert!(row.url.ends_with("/uploads/2024/cat-scaled.jpg"));
        assert_eq!(
            f.objects.object("media", "uploads/2024/cat-150x150.jpg").as_deref(),
            Some(&b"thumb"[..])
        );
        assert_eq!(f.objects.keys("media").len(), 3);

        // Nothing changed: same keys, no backup.
        let SyncOutcome::Updated(again) = f.store.sync_source(&item).await else {
            panic!("expected an update");
        };
        assert_eq!(again.id, row.id);
        assert!(again.extra.backup.is_none());
        assert_eq!(f.objects.keys("media").len(), 3);
    }

    #[tokio::test]
    async fn test_versioning_rotates_and_displaces_previous_location() {
        let f = Fixture::new(|s| s.object_versioning = true);
        f.write("a.jpg", b"v1").await;
        let item = SourceItem::new("a.jpg", "file", "a.jpg");

        let SyncOutcome::Added(first) = f.store.sync_source(&item).await else {
            panic!("expected a new relationship");
        };
        assert_eq!(first.key, "20231114221320/a.jpg");
        assert_eq!(first.extra.object_version.as_deref(), Some("20231114221320"));
        assert!(first.extra.source_fingerprint.as_deref().unwrap().starts_with("2:"));

        f.clock.advance(Duration::from_secs(60));
        f.write("a.jpg", b"edited v2").await;
        let SyncOutcome::Updated(second) = f.store.sync_source(&item).await else {
            panic!("expected an update");
        };
        assert_eq!(second.key, "20231114221420/a.jpg");
        assert_eq!(second.extra.backup.as_ref().unwrap().key, first.key);
        assert!(f.objects.contains("media", &first.key));
    }

    #[tokio::test]
    async fn test_versioned_resync_of_unchanged_file_keeps_key() {
        let f = Fixture::new(|s| s.object_versioning = true);
        f.write("a.jpg", b"v1").await;
        let item = SourceItem::new("a.jpg", "file", "a.jpg");

        let SyncOutcome::Added(first) = f.store.sync_source(&item).await else {
            panic!("expected a new relationship");
        };

        f.clock.advance(Duration::from_secs(60));
        let SyncOutcome::Updated(second) = f.store.sync_source(&item).await else {
            panic!("expected an update");
        };
        assert_eq!(second.key, first.key);
        assert_eq!(second.extra.object_version, first.extra.object_version);
        assert!(second.extra.backup.is_none());
        assert_eq!(f.objects.keys("media"), vec![first.key.clone()]);
    }

    #[tokio::test]
    async fn test_failed_sync_is_logged_and_retry_keeps_generation() {
        let f = Fixture::new(|s| s.object_versioning = true);
        f.write("a.jpg", b"a").await;
        let mut item = SourceItem::new("a.jpg", "file", "a.jpg");
        item.sizes.insert(
            "150x150".into(),
            SourceSize {
                source_path: "a-150x150.jpg".into(),
                width: Some(150),
                height: Some(150),
            },
        );

        let outcome = f.store.sync_source(&item).await;
        assert!(matches!(outcome, SyncOutcome::Failed { code: codes::MISSING_FILE, .. }));
        assert_eq!(
            f.store.errors().get("file", "a.jpg").await.unwrap().unwrap().code,
            codes::MISSING_FILE
        );
        assert!(f.store.get("a.jpg", "file").await.is_none());

        f.clock.advance(Duration::from_secs(3600));
        f.write("a-150x150.jpg", b"t").await;
        let SyncOutcome::Added(row) = f.store.sync_source(&item).await else {
            panic!("expected a new relationship");
        };
        assert_eq!(row.key, "20231114221320/a.jpg");
        assert_eq!(row.extra.sizes["150x150"].key, "20231114221320/a-150x150.jpg");
        assert!(f.store.errors().get("file", "a.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_copies_removed_after_sync() {
        let f = Fixture::new(|s| s.remove_local_files = true);
        f.write("a.jpg", b"a").await;
        f.write("a-150x150.jpg", b"t").await;
        let item = catalog_item(&f, "a.jpg").await;

        assert!(f.store.sync_source(&item).await.is_success());
        assert!(!f.path("a.jpg").exists());
        assert!(!f.path("a-150x150.jpg").exists());
        assert!(f.objects.contains("media", "a-150x150.jpg"));
    }
}
