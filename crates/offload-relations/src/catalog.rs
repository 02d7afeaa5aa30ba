//! Enumeration of local sources that can be offloaded.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use offload_core::OffloadError;
use tracing::debug;

use crate::index::strip_extension;

/// One derived rendition of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSize {
    pub source_path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A local source and the files that belong to it.
///
/// Paths are relative to the store's base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    pub source_id: String,
    pub source_type: String,
    /// File currently served for the source.
    pub source_path: String,
    /// Untransformed master, when it differs from `source_path`.
    pub original_source_path: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sizes: BTreeMap<String, SourceSize>,
    pub is_private: bool,
}

impl SourceItem {
    pub fn new(source_id: impl Into<String>, source_type: impl Into<String>, path: &str) -> Self {
        Self {
            source_id: source_id.into(),
            source_type: source_type.into(),
            source_path: path.to_string(),
            original_source_path: None,
            width: None,
            height: None,
            sizes: BTreeMap::new(),
            is_private: false,
        }
    }
}

/// Source of truth for what exists locally, per source type.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    fn source_type(&self) -> &str;

    async fn total_count(&self) -> Result<u64, OffloadError>;

    /// Every source, in a stable order.
    async fn list(&self) -> Result<Vec<SourceItem>, OffloadError>;

    async fn item(&self, source_id: &str) -> Result<Option<SourceItem>, OffloadError>;
}

/// Catalog over the files below a directory.
///
/// Files named `name-{W}x{H}.ext` next to `name.ext` are treated as derived
/// sizes of it, and `name-scaled.ext` as its served (transformed) copy.
/// Hidden files are ignored. Source ids are the master's relative path.
pub struct DirectoryCatalog {
    root: PathBuf,
    source_type: String,
    private: bool,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>, source_type: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            source_type: source_type.into(),
            private: false,
        }
    }

    /// Mark every item of this catalog private.
    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative paths of every regular, non-hidden file, sorted.
    async fn walk(&self) -> Result<Vec<String>, OffloadError> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir == self.root => {
                    debug!(root = %self.root.display(), "catalog root does not exist");
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        files.push(relative.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

/// `cat-150x100` -> (`cat`, 150, 100)
fn size_suffix(stem: &str) -> Option<(&str, u32, u32)> {
    let (head, dims) = stem.rsplit_once('-')?;
    let (width, height) = dims.split_once('x')?;
    Some((head, width.parse().ok()?, height.parse().ok()?))
}

fn group_files(files: &[String], source_type: &str, private: bool) -> Vec<SourceItem> {
    let present: BTreeSet<&str> = files.iter().map(String::as_str).collect();
    let mut items: BTreeMap<String, SourceItem> = BTreeMap::new();
    let mut scaled: Vec<(String, String)> = Vec::new();
    let mut sizes: Vec<(String, String, SourceSize)> = Vec::new();

    for path in files {
        let stem = strip_extension(path);
        let ext = &path[stem.len()..];

        if let Some(head) = stem.strip_suffix("-scaled") {
            let base = format!("{}{}", head, ext);
            if present.contains(base.as_str()) {
                scaled.push((base, path.clone()));
                continue;
            }
        }
        if let Some((head, width, height)) = size_suffix(stem) {
            let base = format!("{}{}", head, ext);
            if present.contains(base.as_str()) {
                let size = SourceSize {
                    source_path: path.clone(),
                    width: Some(width),
                    height: Some(height),
                };
                sizes.push((base, format!("{}x{}", width, height), size));
                continue;
            }
        }

        let mut item = SourceItem::new(path.as_str(), source_type, path);
        item.is_private = private;
        items.insert(path.clone(), item);
    }

    for (base, served) in scaled {
        if let Some(item) = items.get_mut(&base) {
            item.original_source_path = Some(item.source_path.clone());
            item.source_path = served;
        }
    }

    for (base, name, size) in sizes {
        match items.get_mut(&base) {
            Some(item) => {
                item.sizes.insert(name, size);
            }
            // Size of a size: stands on its own.
            None => {
                let mut item = SourceItem::new(size.source_path.as_str(), source_type, &size.source_path);
                item.is_private = private;
                items.insert(size.source_path.clone(), item);
            }
        }
    }

    items.into_values().collect()
}

#[async_trait]
impl SourceCatalog for DirectoryCatalog {
    fn source_type(&self) -> &str {
        &self.source_type
    }

    async fn total_count(&self) -> Result<u64, OffloadError> {
        Ok(self.list().await?.len() as u64)
    }

    async fn list(&self) -> Result<Vec<SourceItem>, OffloadError> {
        let files = self.walk().await?;
        Ok(group_files(&files, &self.source_type, self.private))
    }

    async fn item(&self, source_id: &str) -> Result<Option<SourceItem>, OffloadError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|item| item.source_id == source_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, relative.as_bytes()).await.unwrap();
    }

    #[test]
    fn test_size_suffix() {
        assert_eq!(size_suffix("cat-150x100"), Some(("cat", 150, 100)));
        assert_eq!(size_suffix("my-cat"), None);
        assert_eq!(size_suffix("cat-axb"), None);
    }

    #[tokio::test]
    async fn test_groups_sizes_and_scaled_copies() {
        let dir = TempDir::new().unwrap();
        for file in [
            "2024/01/cat.jpg",
            "2024/01/cat-scaled.jpg",
            "2024/01/cat-150x150.jpg",
            "2024/01/cat-300x200.jpg",
            "2024/01/notes-2x3.txt",
            "report.pdf",
            ".hidden",
            "2024/.cache/x.jpg",
        ] {
            touch(dir.path(), file).await;
        }

        let catalog = DirectoryCatalog::new(dir.path(), "file");
        let items = catalog.list().await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["2024/01/cat.jpg", "2024/01/notes-2x3.txt", "report.pdf"]);

        let cat = &items[0];
        assert_eq!(cat.source_path, "2024/01/cat-scaled.jpg");
        assert_eq!(cat.original_source_path.as_deref(), Some("2024/01/cat.jpg"));
        assert_eq!(cat.sizes.len(), 2);
        assert_eq!(cat.sizes["300x200"].width, Some(300));

        assert_eq!(catalog.total_count().await.unwrap(), 3);
        assert!(catalog.item("report.pdf").await.unwrap().is_some());
        assert!(catalog.item("2024/01/cat-150x150.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let catalog = DirectoryCatalog::new(dir.path().join("absent"), "file");
        assert_eq!(catalog.total_count().await.unwrap(), 0);
    }
}
