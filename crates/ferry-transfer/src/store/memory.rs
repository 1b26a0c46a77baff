use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;

use super::ObjectStore;
use crate::error::StoreError;

/// Process-local store backed by a hash map.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned(key: &str) -> StoreError {
    StoreError::Io {
        key: key.to_string(),
        source: std::io::Error::other("memory store lock poisoned"),
    }
}

impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let mut objects = self.objects.write().map_err(|_| poisoned(key))?;
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let objects = self.objects.read().map_err(|_| poisoned(key))?;
        objects.get(key).cloned().ok_or_else(|| StoreError::NotFound {
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryStore::new();
        store.put("files/a/chunk_0", Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(store.get("files/a/chunk_0").await.unwrap(), Bytes::from_static(b"hello"));
        assert!(store.contains("files/a/chunk_0"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("files/nope/manifest.json").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
