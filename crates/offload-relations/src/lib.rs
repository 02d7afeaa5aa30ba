//! Sync relationship store for the offload engine.
//!
//! Tracks which local sources live where remotely and keeps the two in step:
//! - `RelationshipStore`: cached CRUD over relationship rows, single-item
//!   sync, restore to local disk and local purges
//! - `RelationshipIndex`: the durable row store (`MemoryIndex`, `D1Index`)
//! - `ProgressCounters` and `ErrorLog`: per source type bookkeeping
//! - `BulkUploader`: scheduler handler working through the backlog

pub mod cache;
pub mod catalog;
pub mod counters;
pub mod index;

mod bulk;
mod error_log;
mod hooks;
mod meta;
mod restore;
mod store;
mod sync;

#[cfg(test)]
mod test_support;

pub use bulk::{BulkUploader, UPLOAD_JOB};
pub use cache::{CacheConfig, RelationshipCache};
pub use catalog::{DirectoryCatalog, SourceCatalog, SourceItem, SourceSize};
pub use counters::ProgressCounters;
pub use error_log::{ErrorEntry, ErrorLog};
pub use hooks::{NoHooks, RelationshipHooks};
pub use index::{D1Config, D1Index, MemoryIndex, PathLookup, RelationshipIndex};
pub use meta::{SourceMeta, SourceMetaCache};
pub use restore::{RestoreOutcome, RestoreReport, RestoredFile};
pub use store::{RelationshipStore, StoreSettings};
pub use sync::SyncOutcome;
