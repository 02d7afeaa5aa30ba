use std::collections::BTreeMap;

use offload_core::{codes, Relationship};
use tracing::{debug, instrument, warn};

use crate::index::PathLookup;
use crate::store::RelationshipStore;

/// Label of the served file in a `RestoreReport`.
pub const CURRENT: &str = "current";
/// Label of the untransformed master in a `RestoreReport`.
pub const ORIGINAL: &str = "original";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    AlreadyLocal,
    Restored,
    Failed { code: u16, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredFile {
    pub source_path: String,
    pub key: String,
    pub outcome: RestoreOutcome,
}

/// Per-file result of bringing a relationship's files back to local disk.
///
/// Keyed by `CURRENT`, `ORIGINAL` or the derived size name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub files: BTreeMap<String, RestoredFile>,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.files
            .values()
            .all(|f| !matches!(f.outcome, RestoreOutcome::Failed { .. }))
    }

    pub fn restored(&self) -> usize {
        self.files
            .values()
            .filter(|f| f.outcome == RestoreOutcome::Restored)
            .count()
    }
}

/// (label, local relative path, remote key) of every file a row covers.
fn file_map(row: &Relationship) -> Vec<(String, String, String)> {
    let mut files = vec![(CURRENT.to_string(), row.source_path.clone(), row.key.clone())];
    if !row.original_source_path.is_empty() && row.original_source_path != row.source_path {
        files.push((
            ORIGINAL.to_string(),
            row.original_source_path.clone(),
            row.original_key.clone(),
        ));
    }
    for (name, size) in &row.extra.sizes {
        files.push((name.clone(), size.source_path.clone(), size.key.clone()));
    }
    files
}

impl RelationshipStore {
    pub async fn move_to_server(&self, source_id: &str, source_type: &str) -> Option<RestoreReport> {
        let row = self.get(source_id, source_type).await?;
        Some(self.move_to_server_by_item(&row).await)
    }

    pub async fn move_to_server_by_source_path(&self, source_path: &str) -> Option<RestoreReport> {
        let row = self
            .get_items_by_paths(&[source_path.to_string()], true, true, PathLookup::Local)
            .await
            .into_iter()
            .next()?;
        Some(self.move_to_server_by_item(&row).await)
    }

    /// Download every file of `row` that is missing locally.
    #[instrument(skip(self, row), fields(source_id = %row.source_id, source_type = %row.source_type))]
    pub async fn move_to_server_by_item(&self, row: &Relationship) -> RestoreReport {
        let mut report = RestoreReport::default();

        for (label, source_path, key) in file_map(row) {
            let outcome = self.restore_file(&source_path, &key).await;
            if let RestoreOutcome::Failed { code, message } = &outcome {
                warn!(label = %label, key = %key, code = *code, message = %message, "restore failed");
            }
            report.files.insert(
                label,
                RestoredFile {
                    source_path,
                    key,
                    outcome,
                },
            );
        }

        debug!(restored = report.restored(), "restore finished");
        report
    }

    async fn restore_file(&self, source_path: &str, key: &str) -> RestoreOutcome {
        let Some(path) = self.local_path(source_path) else {
            return RestoreOutcome::Failed {
                code: codes::UNSUPPORTED,
                message: format!("{} is outside the base directory", source_path),
            };
        };
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return RestoreOutcome::AlreadyLocal;
        }
        if key.is_empty() {
            return RestoreOutcome::Failed {
                code: codes::MISSING_FILE,
                message: "no remote key recorded".to_string(),
            };
        }

        let result = self.provider.object_to_server(key, &path).await;
        if result.success {
            RestoreOutcome::Restored
        } else {
            RestoreOutcome::Failed {
                code: result.code,
                message: result.message,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DirectoryCatalog, SourceCatalog};
    use crate::test_support::Fixture;

    #[tokio::test]
    async fn test_restores_missing_files_and_reports_per_label() {
        let f = Fixture::new(|s| s.remove_local_files = true);
        f.write("cat.jpg", b"original").await;
        f.write("cat-scaled.jpg", b"scaled").await;
        f.write("cat-150x150.jpg", b"thumb").await;
        let item = DirectoryCatalog::new(f.dir.path(), "file")
            .item("cat.jpg")
            .await
            .unwrap()
            .unwrap();
        assert!(f.store.sync_source(&item).await.is_success());
        assert!(!f.path("cat.jpg").exists());

        let report = f.store.move_to_server("cat.jpg", "file").await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.restored(), 3);
        assert_eq!(report.files[CURRENT].source_path, "cat-scaled.jpg");
        assert_eq!(report.files[ORIGINAL].key, "cat.jpg");
        assert_eq!(tokio::fs::read(f.path("cat-150x150.jpg")).await.unwrap(), b"thumb");

        let again = f
            .store
            .move_to_server_by_source_path("cat-scaled.jpg")
            .await
            .unwrap();
        assert!(again
            .files
            .values()
            .all(|file| file.outcome == RestoreOutcome::AlreadyLocal));
    }

    #[tokio::test]
    async fn test_missing_remote_object_is_reported() {
        let f = Fixture::new(|_| {});
        f.write("a.jpg", b"a").await;
        let item = DirectoryCatalog::new(f.dir.path(), "file")
            .item("a.jpg")
            .await
            .unwrap()
            .unwrap();
        assert!(f.store.sync_source(&item).await.is_success());

        tokio::fs::remove_file(f.path("a.jpg")).await.unwrap();
        assert!(f.store.provider().delete_single("a.jpg").await.success);

        let report = f.store.move_to_server("a.jpg", "file").await.unwrap();
        assert!(!report.is_complete());
        assert!(matches!(
            report.files[CURRENT].outcome,
            RestoreOutcome::Failed {
                code: codes::MISSING_FILE,
                ..
            }
        ));

        assert!(f.store.move_to_server("nope", "file").await.is_none());
        assert!(f.store.move_to_server_by_source_path("nope.jpg").await.is_none());
    }
}
