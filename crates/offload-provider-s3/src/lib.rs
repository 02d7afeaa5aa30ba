//! S3-compatible provider backends.
//!
//! One `S3CompatibleProvider` implements the `offload_core::Provider` contract
//! for every variant in `ProviderVariant`. Network access goes through the
//! `ObjectStore` seam: `S3ObjectStore` talks to the real service with
//! `aws-sdk-s3`, `MemoryObjectStore` keeps everything in process.

mod error;
pub mod keys;
pub mod memory;
pub mod multipart;
mod provider;
mod s3;
mod state;
mod store;
mod variant;

pub use error::ObjectStoreError;
pub use memory::MemoryObjectStore;
pub use multipart::{MultipartState, MultipartUploader};
pub use provider::{S3CompatibleProvider, DEFAULT_PART_SIZE, DEFAULT_PRIVATE_URL_EXPIRY};
pub use s3::S3ObjectStore;
pub use state::ObjectStateStore;
pub use store::{ObjectAcl, ObjectHead, ObjectStore, PutOptions, UploadedPart};
pub use variant::ProviderVariant;
