use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use offload_core::{
    Clock, NewRelationship, Provider, ProviderScope, Relationship, RelationshipUpdate, StateStore,
    SystemClock,
};
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheConfig, CachedRelationship, RelationshipCache};
use crate::counters::{ProgressCounters, UPLOADED};
use crate::error_log::ErrorLog;
use crate::hooks::{NoHooks, RelationshipHooks};
use crate::index::{strip_extension, PathLookup, RelationshipIndex};
use crate::meta::{SourceMeta, SourceMetaCache};

/// Deployment settings of a relationship store.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Directory local relative paths are resolved against.
    pub base_dir: PathBuf,
    /// Key prefix for every upload, e.g. `wp-content/uploads/`.
    pub prefix: String,
    /// Insert a timestamp segment into keys, rotated per upload generation.
    pub object_versioning: bool,
    /// Delete local copies once they are safely remote.
    pub remove_local_files: bool,
}

impl StoreSettings {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            prefix: String::new(),
            object_versioning: false,
            remove_local_files: false,
        }
    }
}

/// Local source ↔ remote object relationships for one backend scope.
///
/// Reads go through an in-memory TTL cache, then the persisted per-source
/// metadata, then the index. Public operations never fail: errors are logged
/// and reported as `None`/`false`, so a single bad item never aborts a batch.
pub struct RelationshipStore {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) index: Arc<dyn RelationshipIndex>,
    pub(crate) state: Arc<dyn StateStore>,
    pub(crate) cache: RelationshipCache,
    pub(crate) meta: SourceMetaCache,
    pub(crate) counters: ProgressCounters,
    pub(crate) errors: ErrorLog,
    pub(crate) hooks: Arc<dyn RelationshipHooks>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) scope: ProviderScope,
    pub(crate) settings: StoreSettings,
}

impl RelationshipStore {
    pub fn new(
        provider: Arc<dyn Provider>,
        index: Arc<dyn RelationshipIndex>,
        state: Arc<dyn StateStore>,
        settings: StoreSettings,
    ) -> Self {
        let scope =
            ProviderScope::new(provider.provider_key(), provider.bucket()).with_region(provider.region());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        Self {
            meta: SourceMetaCache::new(state.clone(), &scope),
            counters: ProgressCounters::new(state.clone(), &scope),
            errors: ErrorLog::new(state.clone(), clock.clone()),
            cache: RelationshipCache::default(),
            hooks: Arc::new(NoHooks),
            provider,
            index,
            state,
            clock,
            scope,
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.errors = ErrorLog::new(self.state.clone(), clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn RelationshipHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.cache = RelationshipCache::new(config);
        self
    }

    pub fn scope(&self) -> &ProviderScope {
        &self.scope
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn index(&self) -> &Arc<dyn RelationshipIndex> {
        &self.index
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Insert a row for a freshly uploaded source.
    #[instrument(skip(self, new), fields(source_id = %new.source_id, source_type = %new.source_type))]
    pub async fn add(&self, new: NewRelationship) -> Option<i64> {
        let mut row = Relationship {
            id: None,
            provider: self.scope.provider.clone(),
            region: self.scope.region_value().to_string(),
            bucket: self.scope.bucket.clone(),
            source_id: new.source_id,
            source_type: new.source_type,
            source_path: new.source_path,
            url: new.url,
            key: new.key,
            original_source_path: new.original_source_path,
            original_key: new.original_key,
            is_private: new.is_private,
            extra: new.extra,
        };

        let id = match self.index.insert(&row).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "relationship insert failed");
                return None;
            }
        };
        row.id = Some(id);

        self.remember(&row).await;
        if let Err(e) = self.counters.add(&row.source_type, UPLOADED, 1).await {
            warn!(error = %e, "uploaded counter not incremented");
        }
        info!(id, key = %row.key, "relationship added");
        Some(id)
    }

    /// Row for a source, after `RelationshipHooks::filter_item`.
    pub async fn get(&self, source_id: &str, source_type: &str) -> Option<Relationship> {
        let row = self.lookup(source_id, source_type).await;
        self.hooks.filter_item(row)
    }

    /// Unfiltered cache → metadata → index lookup.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn lookup(&self, source_id: &str, source_type: &str) -> Option<Relationship> {
        match self.cache.get(source_id, source_type).await {
            Some(CachedRelationship::Found(row)) => return Some(row),
            Some(CachedRelationship::Missing) => return None,
            None => {}
        }

        match self.meta.load(source_id, source_type).await {
            Ok(Some(SourceMeta {
                relationship: Some(row),
                ..
            })) => {
                self.cache.insert(&row).await;
                return Some(row);
            }
            Ok(Some(SourceMeta { missing: true, .. })) => {
                self.cache.insert_missing(source_id, source_type).await;
                return None;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "metadata cache unreadable"),
        }

        match self.index.find(&self.scope, source_id, source_type).await {
            Ok(Some(row)) => {
                self.remember(&row).await;
                Some(row)
            }
            Ok(None) => {
                if let Err(e) = self.meta.store_missing(source_id, source_type).await {
                    warn!(error = %e, "negative marker not persisted");
                }
                self.cache.insert_missing(source_id, source_type).await;
                None
            }
            Err(e) => {
                warn!(error = %e, "relationship lookup failed");
                None
            }
        }
    }

    /// Merge `update` over the current row and write it back.
    ///
    /// Returns the re-read row, or `None` when there is no row or the write
    /// failed.
    #[instrument(skip(self, update), fields(backup = ?update.backup))]
    pub async fn update(
        &self,
        source_id: &str,
        update: RelationshipUpdate,
        source_type: &str,
    ) -> Option<Relationship> {
        let previous = match self.index.find(&self.scope, source_id, source_type).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!("no relationship to update");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "relationship lookup failed");
                return None;
            }
        };

        let mut purge = self.hooks.before_update(&previous, &update).await;
        let next = previous.merged(&update);
        if let Err(e) = self.index.update(&next).await {
            warn!(error = %e, "relationship update failed");
            return None;
        }

        self.forget(source_id, source_type).await;
        let current = self.get(source_id, source_type).await;
        purge.extend(
            self.hooks
                .after_update(&previous, current.as_ref().unwrap_or(&next))
                .await,
        );
        if !purge.is_empty() {
            self.purge_local_files(&purge).await;
        }

        debug!(key = %next.key, "relationship updated");
        current
    }

    /// Remove the row and every remote object it references.
    ///
    /// Remote delete failures are logged and do not keep the row alive.
    #[instrument(skip(self))]
    pub async fn delete(&self, source_id: &str, source_type: &str) -> bool {
        let row = match self.index.find(&self.scope, source_id, source_type).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                self.forget(source_id, source_type).await;
                return false;
            }
            Err(e) => {
                warn!(error = %e, "relationship lookup failed");
                return false;
            }
        };
        let Some(id) = row.id else {
            warn!("relationship row has no id");
            return false;
        };

        for key in self.reachable_keys(&row) {
            let result = self.provider.delete_single(&key).await;
            if !result.success {
                warn!(key = %key, code = result.code, message = %result.message, "remote delete failed");
            }
        }

        if let Err(e) = self.index.delete(id).await {
            warn!(error = %e, "relationship delete failed");
            return false;
        }

        self.cache.invalidate(source_id, source_type).await;
        if let Err(e) = self.meta.forget(source_id, source_type).await {
            warn!(error = %e, "metadata not removed");
        }
        if let Err(e) = self.counters.remove(source_type, UPLOADED, 1).await {
            warn!(error = %e, "uploaded counter not decremented");
        }
        if let Err(e) = self.errors.clear(source_type, source_id).await {
            warn!(error = %e, "error log entry not cleared");
        }
        info!(id, "relationship deleted");
        true
    }

    /// Keys to delete with the row; a backup on another backend is left alone.
    fn reachable_keys(&self, row: &Relationship) -> Vec<String> {
        match &row.extra.backup {
            Some(backup)
                if backup.provider != self.scope.provider || backup.bucket != self.scope.bucket =>
            {
                warn!(
                    provider = %backup.provider,
                    bucket = %backup.bucket,
                    "backup lives on another backend, its objects are kept"
                );
                row.snapshot().remote_keys()
            }
            _ => row.remote_keys(),
        }
    }

    /// Rows matching local or remote paths, deduplicated and read through `get`.
    #[instrument(skip(self, paths), level = "debug", fields(count = paths.len()))]
    pub async fn get_items_by_paths(
        &self,
        paths: &[String],
        exact_match: bool,
        first_only: bool,
        lookup: PathLookup,
    ) -> Vec<Relationship> {
        let limit = first_only.then_some(1);
        let rows = match self
            .index
            .find_by_paths(&self.scope, paths, lookup, exact_match, limit)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "path lookup failed");
                return Vec::new();
            }
        };

        let mut seen = BTreeSet::new();
        let mut items = Vec::new();
        for row in rows {
            if !seen.insert((row.source_type.clone(), row.source_id.clone())) {
                continue;
            }
            if let Some(item) = self.get(&row.source_id, &row.source_type).await {
                items.push(item);
            }
        }
        items
    }

    /// Stored local paths sharing `path`'s extension-less prefix.
    pub async fn get_similar_files_by_path(&self, path: &str) -> Vec<String> {
        match self
            .index
            .similar_paths(&self.scope, strip_extension(path))
            .await
        {
            Ok(paths) => paths,
            Err(e) => {
                warn!(path, error = %e, "similar path lookup failed");
                Vec::new()
            }
        }
    }

    /// Delete local files, if the store is configured to remove them.
    ///
    /// Candidates pass through `filter_purge_candidates` and are re-checked
    /// right before deletion. Returns the files actually removed.
    pub async fn purge_local_files(&self, paths: &[String]) -> Vec<PathBuf> {
        if !self.settings.remove_local_files {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for relative in paths {
            let Some(path) = self.local_path(relative) else {
                continue;
            };
            if exists(&path).await && !candidates.contains(&path) {
                candidates.push(path);
            }
        }

        let mut removed = Vec::new();
        for path in self.hooks.filter_purge_candidates(candidates) {
            if !exists(&path).await {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "local file purged");
                    removed.push(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "local purge failed"),
            }
        }
        removed
    }

    pub async fn purge_item_local_files(&self, row: &Relationship) -> Vec<PathBuf> {
        self.purge_local_files(&row.local_paths()).await
    }

    /// Absolute path of a stored relative path; `None` if it would escape
    /// the base directory.
    pub(crate) fn local_path(&self, relative: &str) -> Option<PathBuf> {
        let relative = Path::new(relative);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.as_os_str().is_empty() || escapes {
            warn!(path = %relative.display(), "refusing path outside the base directory");
            return None;
        }
        Some(self.settings.base_dir.join(relative))
    }

    async fn remember(&self, row: &Relationship) {
        if let Err(e) = self.meta.store_relationship(row).await {
            warn!(error = %e, "metadata cache not written");
        }
        self.cache.insert(row).await;
    }

    async fn forget(&self, source_id: &str, source_type: &str) {
        self.cache.invalidate(source_id, source_type).await;
        if let Err(e) = self.meta.invalidate(source_id, source_type).await {
            warn!(error = %e, "metadata cache not invalidated");
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
