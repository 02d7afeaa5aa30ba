//! In-memory relationship cache with moka.
//!
//! Sits in front of the persisted metadata cache and the index:
//! - **Found**: the row as last read or written
//! - **Missing**: negative marker so repeated lookups of unsynced sources
//!   skip the index
//! - **Errors**: never cached; an index failure is retried on the next get

use std::time::Duration;

use moka::future::Cache;
use offload_core::Relationship;

/// Default TTL for cache entries (5 minutes).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;

/// Default max capacity (10,000 entries).
pub const DEFAULT_CACHE_MAX_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live for cache entries
    pub ttl: Duration,

    /// Maximum number of entries
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS),
            max_capacity: DEFAULT_CACHE_MAX_CAPACITY,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedRelationship {
    Found(Relationship),
    Missing,
}

/// (source_type, source_id)
type CacheKey = (String, String);

#[derive(Clone)]
pub struct RelationshipCache {
    entries: Cache<CacheKey, CachedRelationship>,
}

impl RelationshipCache {
    pub fn new(config: CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.ttl)
            .build();
        Self { entries }
    }

    fn key(source_id: &str, source_type: &str) -> CacheKey {
        (source_type.to_string(), source_id.to_string())
    }

    pub async fn get(&self, source_id: &str, source_type: &str) -> Option<CachedRelationship> {
        self.entries.get(&Self::key(source_id, source_type)).await
    }

    pub async fn insert(&self, row: &Relationship) {
        self.entries
            .insert(
                Self::key(&row.source_id, &row.source_type),
                CachedRelationship::Found(row.clone()),
            )
            .await;
    }

    pub async fn insert_missing(&self, source_id: &str, source_type: &str) {
        self.entries
            .insert(Self::key(source_id, source_type), CachedRelationship::Missing)
            .await;
    }

    pub async fn invalidate(&self, source_id: &str, source_type: &str) {
        self.entries
            .invalidate(&Self::key(source_id, source_type))
            .await;
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }
}

impl Default for RelationshipCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
