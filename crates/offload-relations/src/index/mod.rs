//! Relational index over relationship rows.
//!
//! The index is the durable source of truth; the caches in front of it are
//! disposable. Two implementations:
//! - `MemoryIndex`: in-process, enforces the same uniqueness rules as the
//!   SQL schema (tests, single-process deployments)
//! - `D1Index`: Cloudflare D1 through its REST query endpoint

mod d1;
mod memory;

pub use d1::{D1Config, D1Index, DEFAULT_API_BASE};
pub use memory::MemoryIndex;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use offload_core::{OffloadError, ProviderScope, Relationship};

/// Which path columns a path lookup compares against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PathLookup {
    /// `source_path` and `original_source_path`.
    #[default]
    Local,
    /// `key` and `original_key`.
    Remote,
    Both,
}

impl PathLookup {
    pub(crate) fn columns(self) -> &'static [PathColumn] {
        match self {
            PathLookup::Local => &[PathColumn::SourcePath, PathColumn::OriginalSourcePath],
            PathLookup::Remote => &[PathColumn::Key, PathColumn::OriginalKey],
            PathLookup::Both => &[
                PathColumn::SourcePath,
                PathColumn::OriginalSourcePath,
                PathColumn::Key,
                PathColumn::OriginalKey,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathColumn {
    SourcePath,
    OriginalSourcePath,
    Key,
    OriginalKey,
}

impl PathColumn {
    pub(crate) fn sql_name(self) -> &'static str {
        match self {
            PathColumn::SourcePath => "source_path",
            PathColumn::OriginalSourcePath => "original_source_path",
            PathColumn::Key => "object_key",
            PathColumn::OriginalKey => "original_key",
        }
    }

    pub(crate) fn value(self, row: &Relationship) -> &str {
        match self {
            PathColumn::SourcePath => &row.source_path,
            PathColumn::OriginalSourcePath => &row.original_source_path,
            PathColumn::Key => &row.key,
            PathColumn::OriginalKey => &row.original_key,
        }
    }
}

/// Persistent, queryable set of relationship rows.
///
/// Rows are unique per (source_id, source_type, provider, bucket, region);
/// `url`, `key`, `source_path`, `original_source_path` and `original_key` are
/// unique within one backend scope, empty values exempt. Violations surface
/// as `OffloadError::Conflict`.
#[async_trait]
pub trait RelationshipIndex: Send + Sync {
    /// Insert a row, returning its id.
    async fn insert(&self, row: &Relationship) -> Result<i64, OffloadError>;

    /// Overwrite the row with `row.id`.
    async fn update(&self, row: &Relationship) -> Result<(), OffloadError>;

    async fn delete(&self, id: i64) -> Result<(), OffloadError>;

    async fn find(
        &self,
        scope: &ProviderScope,
        source_id: &str,
        source_type: &str,
    ) -> Result<Option<Relationship>, OffloadError>;

    /// Rows whose path columns match any of `paths`.
    ///
    /// Exact lookups compare whole values; otherwise the extension is
    /// stripped and values are matched by prefix.
    async fn find_by_paths(
        &self,
        scope: &ProviderScope,
        paths: &[String],
        lookup: PathLookup,
        exact: bool,
        limit: Option<usize>,
    ) -> Result<Vec<Relationship>, OffloadError>;

    /// Distinct local paths (current or original) starting with `prefix`.
    async fn similar_paths(
        &self,
        scope: &ProviderScope,
        prefix: &str,
    ) -> Result<Vec<String>, OffloadError>;

    /// Number of rows per source type.
    async fn count_by_source_type(
        &self,
        scope: &ProviderScope,
    ) -> Result<BTreeMap<String, u64>, OffloadError>;

    /// Ids of every source of `source_type` that has a row.
    async fn source_ids(
        &self,
        scope: &ProviderScope,
        source_type: &str,
    ) -> Result<BTreeSet<String>, OffloadError>;
}

/// `photos/cat.jpg` -> `photos/cat`; dots in directory names are kept.
pub fn strip_extension(path: &str) -> &str {
    let file_start = path.rfind('/').map_or(0, |i| i + 1);
    match path[file_start..].rfind('.') {
        Some(0) | None => path,
        Some(dot) => &path[..file_start + dot],
    }
}

/// Lookup needles for `paths`: whole values, or extension-less prefixes.
pub(crate) fn needles(paths: &[String], exact: bool) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for path in paths {
        let needle = if exact {
            path.as_str()
        } else {
            strip_extension(path)
        };
        if !needle.is_empty() && !out.iter().any(|n| n == needle) {
            out.push(needle.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_extension() {
        assert_eq!(strip_extension("2024/01/cat.jpg"), "2024/01/cat");
        assert_eq!(strip_extension("v1.2/readme"), "v1.2/readme");
        assert_eq!(strip_extension("archive.tar.gz"), "archive.tar");
        assert_eq!(strip_extension("dir/.hidden"), "dir/.hidden");
    }

    #[test]
    fn test_needles_deduplicate() {
        let paths = vec!["a.jpg".to_string(), "a.png".to_string(), String::new()];
        assert_eq!(needles(&paths, false), vec!["a"]);
        assert_eq!(needles(&paths, true), vec!["a.jpg", "a.png"]);
    }
}
