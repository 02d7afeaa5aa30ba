use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backoff::Backoff;
use crate::error::OffloadError;

/// Maximum retries for CAS (compare-and-swap) loops.
const CAS_MAX_RETRIES: u32 = 10;
const CAS_BACKOFF: Backoff = Backoff::new(Duration::from_millis(20), 6, Duration::from_millis(20));

/// A stored document together with its opaque version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub data: Vec<u8>,
    pub version: String,
}

/// Durable keyed document store with conditional writes.
///
/// Every read-modify-write on scheduler state goes through `store_if`, which
/// only succeeds when the stored version still matches `expected`
/// (`None` = the key must not exist yet). A mismatch is `OffloadError::Lock`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, OffloadError>;

    /// Conditionally write `data`, returning the new version.
    async fn store_if(
        &self,
        key: &str,
        data: &[u8],
        expected: Option<&str>,
    ) -> Result<String, OffloadError>;

    async fn remove(&self, key: &str) -> Result<(), OffloadError>;
}

/// Read a JSON document, falling back to `T::default()` when absent.
pub async fn read_document<T>(store: &dyn StateStore, key: &str) -> Result<T, OffloadError>
where
    T: DeserializeOwned + Default,
{
    match store.load(key).await? {
        Some(versioned) => Ok(serde_json::from_slice(&versioned.data)?),
        None => Ok(T::default()),
    }
}

/// Atomically read-modify-write a JSON document.
///
/// 1. load document + version
/// 2. apply `mutator`
/// 3. conditional write against the version read in step 1
/// 4. on conflict, retry from step 1 (up to `CAS_MAX_RETRIES`)
///
/// The mutator returns `false` to abandon the write; the current value is
/// returned unchanged in that case.
pub async fn update_document<T, F>(
    store: &dyn StateStore,
    key: &str,
    mut mutator: F,
) -> Result<T, OffloadError>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnMut(&mut T) -> bool,
{
    for attempt in 0..CAS_MAX_RETRIES {
        let (mut value, version) = match store.load(key).await? {
            Some(versioned) => (
                serde_json::from_slice::<T>(&versioned.data)?,
                Some(versioned.version),
            ),
            None => (T::default(), None),
        };

        if !mutator(&mut value) {
            return Ok(value);
        }

        let json = serde_json::to_vec(&value)?;
        match store.store_if(key, &json, version.as_deref()).await {
            Ok(_) => {
                debug!(attempt, key, "CAS update succeeded");
                return Ok(value);
            }
            Err(OffloadError::Lock(_)) => {
                warn!(attempt, key, "CAS conflict, retrying");
                CAS_BACKOFF.sleep(attempt).await;
            }
            Err(e) => return Err(e),
        }
    }

    Err(OffloadError::Lock(format!(
        "CAS update exhausted {} retries for {}",
        CAS_MAX_RETRIES, key
    )))
}

/// Unconditionally overwrite a JSON document.
pub async fn write_document<T>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
) -> Result<(), OffloadError>
where
    T: Serialize + DeserializeOwned + Default,
{
    let json = serde_json::to_vec(value)?;
    for attempt in 0..CAS_MAX_RETRIES {
        let version = store.load(key).await?.map(|v| v.version);
        match store.store_if(key, &json, version.as_deref()).await {
            Ok(_) => return Ok(()),
            Err(OffloadError::Lock(_)) => CAS_BACKOFF.sleep(attempt).await,
            Err(e) => return Err(e),
        }
    }
    Err(OffloadError::Lock(format!(
        "overwrite exhausted {} retries for {}",
        CAS_MAX_RETRIES, key
    )))
}

/// In-process `StateStore`, versioned by a monotonically increasing counter.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: DashMap<String, (Vec<u8>, String)>,
    next_version: AtomicU64,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, key: &str) -> Result<Option<Versioned>, OffloadError> {
        Ok(self.entries.get(key).map(|entry| Versioned {
            data: entry.0.clone(),
            version: entry.1.clone(),
        }))
    }

    async fn store_if(
        &self,
        key: &str,
        data: &[u8],
        expected: Option<&str>,
    ) -> Result<String, OffloadError> {
        let version = (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let entry = self.entries.entry(key.to_string());
        match (entry, expected) {
            (Entry::Vacant(vacant), None) => {
                vacant.insert((data.to_vec(), version.clone()));
                Ok(version)
            }
            (Entry::Occupied(mut occupied), Some(expected))
                if occupied.get().1 == expected =>
            {
                occupied.insert((data.to_vec(), version.clone()));
                Ok(version)
            }
            _ => Err(OffloadError::Lock(format!(
                "version mismatch for {}: object was modified concurrently",
                key
            ))),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), OffloadError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Counter {
        value: u32,
    }

    #[tokio::test]
    async fn test_store_if_rejects_stale_version() {
        let store = MemoryStateStore::new();
        let v1 = store.store_if("k", b"1", None).await.unwrap();

        // creating again must fail
        assert!(matches!(
            store.store_if("k", b"2", None).await,
            Err(OffloadError::Lock(_))
        ));

        let v2 = store.store_if("k", b"2", Some(&v1)).await.unwrap();
        assert_ne!(v1, v2);

        // v1 is stale now
        tokio_test::assert_err!(store.store_if("k", b"3", Some(&v1)).await);
        assert_eq!(store.load("k").await.unwrap().unwrap().data, b"2");
    }

    #[tokio::test]
    async fn test_update_document_creates_and_mutates() {
        let store = MemoryStateStore::new();
        for _ in 0..3 {
            update_document(&store, "counter", |c: &mut Counter| {
                c.value += 1;
                true
            })
            .await
            .unwrap();
        }
        let counter: Counter = read_document(&store, "counter").await.unwrap();
        assert_eq!(counter.value, 3);
    }

    #[tokio::test]
    async fn test_update_document_abandoned_write() {
        let store = MemoryStateStore::new();
        let value = update_document(&store, "counter", |c: &mut Counter| {
            c.value = 9;
            false
        })
        .await
        .unwrap();
        assert_eq!(value.value, 9);
        assert!(store.load("counter").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_document_overwrites() {
        let store = MemoryStateStore::new();
        write_document(&store, "c", &Counter { value: 1 }).await.unwrap();
        write_document(&store, "c", &Counter { value: 7 }).await.unwrap();
        let counter: Counter = read_document(&store, "c").await.unwrap();
        assert_eq!(counter, Counter { value: 7 });
        tokio_test::assert_ok!(store.remove("c").await);
        assert!(store.is_empty());
    }
}
