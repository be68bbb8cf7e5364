//! Key-value store contract and in-memory implementation

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::RwLock;

/// CRUD contract for the key-value store the engine persists state into.
///
/// Implementations must be safe to share across tasks. All values are JSON;
/// binary payloads are the backend's concern, not the engine's.
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value, or `None` if the key is absent.
    fn get_value<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>>;

    /// Store a value under `key`, overwriting any previous value.
    fn set_value<'a>(
        &'a self,
        key: &'a str,
        value: serde_json::Value,
    ) -> BoxFuture<'a, Result<()>>;

    /// Remove a key; removing an absent key is not an error.
    fn delete_value<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

    /// List all stored keys.
    fn list_keys(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// Process-local key-value store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_value<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<serde_json::Value>>> {
        Box::pin(async move { Ok(self.values.read().get(key).cloned()) })
    }

    fn set_value<'a>(
        &'a self,
        key: &'a str,
        value: serde_json::Value,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.values.write().insert(key.to_string(), value);
            Ok(())
        })
    }

    fn delete_value<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.values.write().remove(key);
            Ok(())
        })
    }

    fn list_keys(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut keys: Vec<String> = self.values.read().keys().cloned().collect();
            keys.sort();
            Ok(keys)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = MemoryKeyValueStore::new();

        store
            .set_value("alpha", json!({"n": 1}))
            .await
            .expect("set should succeed");
        assert_eq!(
            store.get_value("alpha").await.expect("get should succeed"),
            Some(json!({"n": 1}))
        );

        store
            .delete_value("alpha")
            .await
            .expect("delete should succeed");
        assert_eq!(
            store.get_value("alpha").await.expect("get should succeed"),
            None
        );
    }

    #[tokio::test]
    async fn list_keys_is_sorted() {
        let store = MemoryKeyValueStore::new();
        store.set_value("b", json!(2)).await.expect("set");
        store.set_value("a", json!(1)).await.expect("set");

        assert_eq!(
            store.list_keys().await.expect("list"),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
