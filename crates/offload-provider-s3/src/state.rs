use std::sync::Arc;

use async_trait::async_trait;
use offload_core::{OffloadError, StateStore, Versioned};
use tracing::instrument;

use crate::store::ObjectStore;

/// `StateStore` kept as JSON objects in a bucket.
///
/// Versions are object ETags; `store_if` maps onto `If-Match` /
/// `If-None-Match: *`, so concurrent workers sharing one bucket never
/// overwrite each other's scheduler state.
pub struct ObjectStateStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl ObjectStateStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        Self {
            store,
            bucket: bucket.into(),
            prefix: if prefix.is_empty() {
                String::new()
            } else {
                format!("{}/", prefix)
            },
        }
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}{}.json", self.prefix, key)
    }
}

#[async_trait]
impl StateStore for ObjectStateStore {
    #[instrument(skip(self), level = "debug")]
    async fn load(&self, key: &str) -> Result<Option<Versioned>, OffloadError> {
        Ok(self
            .store
            .get_object(&self.bucket, &self.object_key(key))
            .await?
            .map(|(data, version)| Versioned { data, version }))
    }

    #[instrument(skip(self, data), level = "debug")]
    async fn store_if(
        &self,
        key: &str,
        data: &[u8],
        expected: Option<&str>,
    ) -> Result<String, OffloadError> {
        Ok(self
            .store
            .put_object_conditional(&self.bucket, &self.object_key(key), data.to_vec(), expected)
            .await?)
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, key: &str) -> Result<(), OffloadError> {
        Ok(self
            .store
            .delete_object(&self.bucket, &self.object_key(key))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use offload_core::{read_document, update_document};

    #[tokio::test]
    async fn test_documents_round_trip_through_bucket() {
        let objects = Arc::new(MemoryObjectStore::new().with_bucket("state"));
        let store = ObjectStateStore::new(objects.clone(), "state", "/offload/");

        update_document(&store, "jobs/upload/state", |v: &mut Vec<u32>| {
            v.push(1);
            true
        })
        .await
        .unwrap();

        assert!(objects.contains("state", "offload/jobs/upload/state.json"));
        let value: Vec<u32> = read_document(&store, "jobs/upload/state").await.unwrap();
        assert_eq!(value, vec![1]);
    }

    #[tokio::test]
    async fn test_stale_version_is_lock_error() {
        let objects = Arc::new(MemoryObjectStore::new().with_bucket("state"));
        let store = ObjectStateStore::new(objects, "state", "");

        let v1 = store.store_if("k", b"{\"a\":1}", None).await.unwrap();
        store.store_if("k", b"{\"a\":2}", Some(&v1)).await.unwrap();
        assert!(matches!(
            store.store_if("k", b"{\"a\":3}", Some(&v1)).await,
            Err(OffloadError::Lock(_))
        ));
    }
}
