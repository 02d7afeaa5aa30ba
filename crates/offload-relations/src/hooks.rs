use std::path::PathBuf;

use async_trait::async_trait;
use offload_core::{Relationship, RelationshipUpdate};

/// Extension points around relationship reads, updates and local purges.
///
/// Every method has a pass-through default, so implementors override only
/// what they need.
#[async_trait]
pub trait RelationshipHooks: Send + Sync {
    /// Adjust or hide a row on its way out of `get`.
    fn filter_item(&self, row: Option<Relationship>) -> Option<Relationship> {
        row
    }

    /// Called before an update is merged and written.
    ///
    /// Returns extra local relative paths to purge once the update succeeds.
    async fn before_update(
        &self,
        _previous: &Relationship,
        _update: &RelationshipUpdate,
    ) -> Vec<String> {
        Vec::new()
    }

    /// Called after an update was written; same contract as `before_update`.
    async fn after_update(&self, _previous: &Relationship, _current: &Relationship) -> Vec<String> {
        Vec::new()
    }

    /// Last chance to veto local deletions.
    fn filter_purge_candidates(&self, candidates: Vec<PathBuf>) -> Vec<PathBuf> {
        candidates
    }
}

/// Hooks that change nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl RelationshipHooks for NoHooks {}
