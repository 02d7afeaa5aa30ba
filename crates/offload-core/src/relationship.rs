use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Object-versioning segment for uploads made at `now`, e.g. `20240131120509`.
///
/// Inserted into keys so a re-upload of a changed file never collides with
/// cached copies of the previous one.
pub fn object_version(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// Backend scope a relationship row belongs to.
///
/// `region` is `None` when the deployment has no region configured; lookups
/// then ignore the region column entirely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderScope {
    pub provider: String,
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl ProviderScope {
    pub fn new(provider: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            bucket: bucket.into(),
            region: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        let region = region.into();
        self.region = if region.is_empty() { None } else { Some(region) };
        self
    }

    pub fn region_value(&self) -> &str {
        self.region.as_deref().unwrap_or("")
    }

    /// Whether a row written with these coordinates belongs to this scope.
    pub fn contains(&self, provider: &str, bucket: &str, region: &str) -> bool {
        self.provider == provider
            && self.bucket == bucket
            && self.region.as_deref().map_or(true, |r| r == region)
    }
}

/// One derived rendition of a source (thumbnail, resized copy...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedObject {
    pub source_path: String,
    pub url: String,
    pub key: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Snapshot of a previous remote location.
///
/// Deliberately has no backup of its own, so a backup can never nest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousLocation {
    pub provider: String,
    pub region: String,
    pub bucket: String,
    pub source_path: String,
    pub url: String,
    pub key: String,
    pub original_source_path: String,
    pub original_key: String,
    pub is_private: bool,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub object_version: Option<String>,
    #[serde(default)]
    pub sizes: BTreeMap<String, DerivedObject>,
}

impl PreviousLocation {
    /// Every remote key the snapshot references, deduplicated.
    pub fn remote_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        push_key(&mut keys, &self.key);
        push_key(&mut keys, &self.original_key);
        for size in self.sizes.values() {
            push_key(&mut keys, &size.key);
        }
        keys
    }
}

/// Structured blob stored alongside each relationship row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipExtra {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Object-versioning prefix used when the item was uploaded.
    #[serde(default)]
    pub object_version: Option<String>,
    /// Size and modification time of the source when it was uploaded.
    #[serde(default)]
    pub source_fingerprint: Option<String>,
    #[serde(default)]
    pub sizes: BTreeMap<String, DerivedObject>,
    #[serde(default)]
    pub backup: Option<PreviousLocation>,
}

/// Persisted mapping between one local source and its remote objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub id: Option<i64>,
    pub provider: String,
    pub region: String,
    pub bucket: String,
    pub source_id: String,
    pub source_type: String,
    pub source_path: String,
    pub url: String,
    pub key: String,
    pub original_source_path: String,
    pub original_key: String,
    pub is_private: bool,
    #[serde(default)]
    pub extra: RelationshipExtra,
}

impl Relationship {
    /// Current location as a backup snapshot (dropping any backup it holds).
    pub fn snapshot(&self) -> PreviousLocation {
        PreviousLocation {
            provider: self.provider.clone(),
            region: self.region.clone(),
            bucket: self.bucket.clone(),
            source_path: self.source_path.clone(),
            url: self.url.clone(),
            key: self.key.clone(),
            original_source_path: self.original_source_path.clone(),
            original_key: self.original_key.clone(),
            is_private: self.is_private,
            width: self.extra.width,
            height: self.extra.height,
            object_version: self.extra.object_version.clone(),
            sizes: self.extra.sizes.clone(),
        }
    }

    /// Every remote key reachable from the row, including the backup's.
    pub fn remote_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        push_key(&mut keys, &self.key);
        push_key(&mut keys, &self.original_key);
        for size in self.extra.sizes.values() {
            push_key(&mut keys, &size.key);
        }
        if let Some(backup) = &self.extra.backup {
            for key in backup.remote_keys() {
                push_key(&mut keys, &key);
            }
        }
        keys
    }

    /// Local relative paths of the current, original and derived files.
    pub fn local_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        push_key(&mut paths, &self.source_path);
        push_key(&mut paths, &self.original_source_path);
        for size in self.extra.sizes.values() {
            push_key(&mut paths, &size.source_path);
        }
        paths
    }

    /// Merge `update` over this row; omitted fields keep their previous value.
    pub fn merged(&self, update: &RelationshipUpdate) -> Relationship {
        let mut next = self.clone();

        if let Some(v) = &update.source_path {
            next.source_path = v.clone();
        }
        if let Some(v) = &update.url {
            next.url = v.clone();
        }
        if let Some(v) = &update.key {
            next.key = v.clone();
        }
        if let Some(v) = &update.original_source_path {
            next.original_source_path = v.clone();
        }
        if let Some(v) = &update.original_key {
            next.original_key = v.clone();
        }
        if let Some(v) = update.is_private {
            next.is_private = v;
        }
        if let Some(extra) = &update.extra {
            let kept_backup = next.extra.backup.take();
            next.extra = extra.clone();
            if next.extra.backup.is_none() {
                next.extra.backup = kept_backup;
            }
        }

        match update.backup {
            BackupPolicy::Keep => {}
            BackupPolicy::Displace => next.extra.backup = Some(self.snapshot()),
            BackupPolicy::Discard => next.extra.backup = None,
        }

        next
    }
}

fn push_key(keys: &mut Vec<String>, key: &str) {
    if !key.is_empty() && !keys.iter().any(|k| k == key) {
        keys.push(key.to_string());
    }
}

/// Fields for a new relationship; the store fills in its own scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRelationship {
    pub source_id: String,
    pub source_type: String,
    pub url: String,
    pub key: String,
    pub source_path: String,
    pub original_source_path: String,
    pub original_key: String,
    #[serde(default)]
    pub extra: RelationshipExtra,
    #[serde(default)]
    pub is_private: bool,
}

/// What happens to the backup slot when a row is updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPolicy {
    /// Leave the existing backup untouched.
    #[default]
    Keep,
    /// Move the previous location into the backup, replacing any older one.
    Displace,
    /// Drop the backup.
    Discard,
}

/// Partial update of a relationship row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipUpdate {
    #[serde(default)]
    pub source_path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub original_source_path: Option<String>,
    #[serde(default)]
    pub original_key: Option<String>,
    #[serde(default)]
    pub is_private: Option<bool>,
    #[serde(default)]
    pub extra: Option<RelationshipExtra>,
    #[serde(default)]
    pub backup: BackupPolicy,
}
