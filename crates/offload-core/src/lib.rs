//! Core traits and types for the offload engine.
//!
//! This crate defines the abstractions shared between the provider, relationship
//! and scheduler crates:
//! - `Provider`: uniform contract over S3-style object storage backends
//! - `Relationship`: persisted local file ↔ remote object mapping
//! - `StateStore`: versioned keyed documents with compare-and-swap writes
//! - `Clock`: wall-clock source, swappable in tests

mod backoff;
mod clock;
mod error;
mod provider;
mod relationship;
mod state;

pub use backoff::{jitter, Backoff};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::OffloadError;
pub use provider::{
    codes, BucketConfig, CredentialCheck, Provider, ProviderResult, ProviderSettings,
    UploadedObject,
};
pub use relationship::{
    object_version, BackupPolicy, DerivedObject, NewRelationship, PreviousLocation,
    ProviderScope, Relationship, RelationshipExtra, RelationshipUpdate,
};
pub use state::{
    read_document, update_document, write_document, MemoryStateStore, StateStore, Versioned,
};
