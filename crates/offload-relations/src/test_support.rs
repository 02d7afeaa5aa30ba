use std::path::PathBuf;
use std::sync::Arc;

use offload_core::{ManualClock, MemoryStateStore, ProviderSettings};
use offload_provider_s3::{MemoryObjectStore, ProviderVariant, S3CompatibleProvider};
use tempfile::TempDir;

use crate::hooks::{NoHooks, RelationshipHooks};
use crate::index::MemoryIndex;
use crate::store::{RelationshipStore, StoreSettings};

/// A store over in-memory backends and a temporary base directory.
pub(crate) struct Fixture {
    pub dir: TempDir,
    pub objects: Arc<MemoryObjectStore>,
    pub index: Arc<MemoryIndex>,
    pub state: Arc<MemoryStateStore>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<RelationshipStore>,
}

impl Fixture {
    pub fn new(configure: impl FnOnce(&mut StoreSettings)) -> Self {
        Self::with_hooks(configure, Arc::new(NoHooks))
    }

    pub fn with_hooks(
        configure: impl FnOnce(&mut StoreSettings),
        hooks: Arc<dyn RelationshipHooks>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let objects = Arc::new(MemoryObjectStore::new().with_bucket("media"));
        let provider = S3CompatibleProvider::with_store(
            ProviderVariant::AmazonS3,
            objects.clone(),
            &ProviderSettings::new()
                .with("bucket", "media")
                .with("region", "eu-west-1"),
        )
        .unwrap();
        let index = Arc::new(MemoryIndex::new());
        let state = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::default());

        let mut settings = StoreSettings::new(dir.path());
        configure(&mut settings);
        let store = RelationshipStore::new(Arc::new(provider), index.clone(), state.clone(), settings)
            .with_clock(clock.clone())
            .with_hooks(hooks);

        Self {
            dir,
            objects,
            index,
            state,
            clock,
            store: Arc::new(store),
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub async fn write(&self, relative: &str, data: &[u8]) {
        let path = self.path(relative);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, data).await.unwrap();
    }
}
