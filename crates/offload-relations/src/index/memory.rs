use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use offload_core::{OffloadError, ProviderScope, Relationship};
use tokio::sync::RwLock;

use super::{needles, PathLookup, RelationshipIndex};

#[derive(Default)]
struct Rows {
    next_id: i64,
    by_id: BTreeMap<i64, Relationship>,
}

/// In-process index with the same uniqueness rules as the SQL schema.
#[derive(Default)]
pub struct MemoryIndex {
    rows: RwLock<Rows>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every stored row, in id order.
    pub async fn rows(&self) -> Vec<Relationship> {
        self.rows.read().await.by_id.values().cloned().collect()
    }
}

fn same_backend(a: &Relationship, b: &Relationship) -> bool {
    a.provider == b.provider && a.bucket == b.bucket && a.region == b.region
}

fn in_scope(scope: &ProviderScope, row: &Relationship) -> bool {
    scope.contains(&row.provider, &row.bucket, &row.region)
}

fn check_unique(rows: &Rows, candidate: &Relationship) -> Result<(), OffloadError> {
    let unique_columns: [(&str, fn(&Relationship) -> &str); 5] = [
        ("url", |r| r.url.as_str()),
        ("key", |r| r.key.as_str()),
        ("source_path", |r| r.source_path.as_str()),
        ("original_source_path", |r| r.original_source_path.as_str()),
        ("original_key", |r| r.original_key.as_str()),
    ];

    for other in rows.by_id.values() {
        if other.id == candidate.id || !same_backend(other, candidate) {
            continue;
        }
        if other.source_id == candidate.source_id && other.source_type == candidate.source_type {
            return Err(OffloadError::Conflict(format!(
                "{} {} already has a row",
                candidate.source_type, candidate.source_id
            )));
        }
        for (column, value) in unique_columns {
            let mine = value(candidate);
            if !mine.is_empty() && mine == value(other) {
                return Err(OffloadError::Conflict(format!(
                    "{} {:?} already used by row {:?}",
                    column, mine, other.id
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl RelationshipIndex for MemoryIndex {
    async fn insert(&self, row: &Relationship) -> Result<i64, OffloadError> {
        let mut rows = self.rows.write().await;
        let mut row = row.clone();
        row.id = None;
        check_unique(&rows, &row)?;

        rows.next_id += 1;
        let id = rows.next_id;
        row.id = Some(id);
        rows.by_id.insert(id, row);
        Ok(id)
    }

    async fn update(&self, row: &Relationship) -> Result<(), OffloadError> {
        let id = row
            .id
            .ok_or_else(|| OffloadError::Index("update of a row without id".to_string()))?;
        let mut rows = self.rows.write().await;
        if !rows.by_id.contains_key(&id) {
            return Err(OffloadError::NotFound(format!("relationship row {}", id)));
        }
        check_unique(&rows, row)?;
        rows.by_id.insert(id, row.clone());
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<(), OffloadError> {
        self.rows.write().await.by_id.remove(&id);
        Ok(())
    }

    async fn find(
        &self,
        scope: &ProviderScope,
        source_id: &str,
        source_type: &str,
    ) -> Result<Option<Relationship>, OffloadError> {
        let rows = self.rows.read().await;
        Ok(rows
            .by_id
            .values()
            .find(|r| {
                in_scope(scope, r) && r.source_id == source_id && r.source_type == source_type
            })
            .cloned())
    }

    async fn find_by_paths(
        &self,
        scope: &ProviderScope,
        paths: &[String],
        lookup: PathLookup,
        exact: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Relationship>, OffloadError> {
        let needles = needles(paths, exact);
        if needles.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.rows.read().await;
        let matches = rows.by_id.values().filter(|row| {
            in_scope(scope, row)
                && lookup.columns().iter().any(|column| {
                    let value = column.value(row);
                    !value.is_empty()
                        && needles.iter().any(|n| {
                            if exact {
                                value == n
                            } else {
                                value.starts_with(n.as_str())
                            }
                        })
                })
        });

        Ok(matches
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn similar_paths(
        &self,
        scope: &ProviderScope,
        prefix: &str,
    ) -> Result<Vec<String>, OffloadError> {
        let rows = self.rows.read().await;
        let mut found = BTreeSet::new();
        for row in rows.by_id.values().filter(|r| in_scope(scope, r)) {
            for path in [&row.source_path, &row.original_source_path] {
                if !path.is_empty() && path.starts_with(prefix) {
                    found.insert(path.clone());
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    async fn count_by_source_type(
        &self,
        scope: &ProviderScope,
    ) -> Result<BTreeMap<String, u64>, OffloadError> {
        let rows = self.rows.read().await;
        let mut counts = BTreeMap::new();
        for row in rows.by_id.values().filter(|r| in_scope(scope, r)) {
            *counts.entry(row.source_type.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn source_ids(
        &self,
        scope: &ProviderScope,
        source_type: &str,
    ) -> Result<BTreeSet<String>, OffloadError> {
        let rows = self.rows.read().await;
        Ok(rows
            .by_id
            .values()
            .filter(|r| in_scope(scope, r) && r.source_type == source_type)
            .map(|r| r.source_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(source_id: &str, path: &str) -> Relationship {
        Relationship {
            provider: "aws".to_string(),
            region: "eu-west-1".to_string(),
            bucket: "media".to_string(),
            source_id: source_id.to_string(),
            source_type: "file".to_string(),
            source_path: path.to_string(),
            url: format!("https://cdn.example.com/{}", path),
            key: format!("uploads/{}", path),
            original_source_path: path.to_string(),
            original_key: format!("uploads/{}", path),
            ..Default::default()
        }
    }

    fn scope() -> ProviderScope {
        ProviderScope::new("aws", "media").with_region("eu-west-1")
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_rejects_duplicates() {
        let index = MemoryIndex::new();
        assert_eq!(index.insert(&row("1", "a.jpg")).await.unwrap(), 1);
        assert_eq!(index.insert(&row("2", "b.jpg")).await.unwrap(), 2);

        let dup_source = index.insert(&row("1", "c.jpg")).await;
        assert!(matches!(dup_source, Err(OffloadError::Conflict(_))));

        let dup_key = index.insert(&row("3", "a.jpg")).await;
        assert!(matches!(dup_key, Err(OffloadError::Conflict(_))));

        let mut other_bucket = row("1", "a.jpg");
        other_bucket.bucket = "archive".to_string();
        assert!(index.insert(&other_bucket).await.is_ok());
    }

    #[tokio::test]
    async fn test_region_predicate_only_when_configured() {
        let index = MemoryIndex::new();
        index.insert(&row("1", "a.jpg")).await.unwrap();

        let regionless = ProviderScope::new("aws", "media");
        assert!(index.find(&regionless, "1", "file").await.unwrap().is_some());

        let elsewhere = ProviderScope::new("aws", "media").with_region("us-east-1");
        assert!(index.find(&elsewhere, "1", "file").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_checks_uniqueness_against_other_rows() {
        let index = MemoryIndex::new();
        let id = index.insert(&row("1", "a.jpg")).await.unwrap();
        index.insert(&row("2", "b.jpg")).await.unwrap();

        let mut first = index.find(&scope(), "1", "file").await.unwrap().unwrap();
        assert_eq!(first.id, Some(id));
        first.url = "https://cdn.example.com/a2.jpg".to_string();
        index.update(&first).await.unwrap();

        first.key = "uploads/b.jpg".to_string();
        assert!(matches!(
            index.update(&first).await,
            Err(OffloadError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_path_lookups() {
        let index = MemoryIndex::new();
        index.insert(&row("1", "2024/cat.jpg")).await.unwrap();
        index.insert(&row("2", "2024/cat-scaled.jpg")).await.unwrap();
        index.insert(&row("3", "2024/dog.jpg")).await.unwrap();

        let exact = index
            .find_by_paths(&scope(), &["2024/cat.jpg".to_string()], PathLookup::Local, true, None)
            .await
            .unwrap();
        assert_eq!(exact.len(), 1);

        let prefix = index
            .find_by_paths(&scope(), &["2024/cat.webp".to_string()], PathLookup::Local, false, None)
            .await
            .unwrap();
        assert_eq!(prefix.len(), 2);

        let first_only = index
            .find_by_paths(&scope(), &["2024/cat.png".to_string()], PathLookup::Local, false, Some(1))
            .await
            .unwrap();
        assert_eq!(first_only.len(), 1);

        let remote = index
            .find_by_paths(&scope(), &["uploads/2024/dog.jpg".to_string()], PathLookup::Remote, true, None)
            .await
            .unwrap();
        assert_eq!(remote[0].source_id, "3");
        let local_only = index
            .find_by_paths(&scope(), &["uploads/2024/dog.jpg".to_string()], PathLookup::Local, true, None)
            .await
            .unwrap();
        assert!(local_only.is_empty());

        let similar = index.similar_paths(&scope(), "2024/cat").await.unwrap();
        assert_eq!(similar, vec!["2024/cat-scaled.jpg", "2024/cat.jpg"]);
    }

    #[tokio::test]
    async fn test_counts_and_source_ids() {
        let index = MemoryIndex::new();
        index.insert(&row("1", "a.jpg")).await.unwrap();
        let mut doc = row("9", "doc.pdf");
        doc.source_type = "document".to_string();
        index.insert(&doc).await.unwrap();

        let counts = index.count_by_source_type(&scope()).await.unwrap();
        assert_eq!(counts.get("file"), Some(&1));
        assert_eq!(counts.get("document"), Some(&1));

        let ids = index.source_ids(&scope(), "document").await.unwrap();
        assert!(ids.contains("9"));

        index.delete(1).await.unwrap();
        assert_eq!(index.len().await, 1);
    }
}
