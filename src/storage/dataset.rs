//! Dataset contract and in-memory implementation
//!
//! A dataset is the append-only sink for handler results (`push_data`).

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::RwLock;

/// Append-only result storage.
pub trait Dataset: Send + Sync {
    /// Append items in order.
    fn push_data(&self, items: Vec<serde_json::Value>) -> BoxFuture<'_, Result<()>>;

    /// Read back a window of items in insertion order.
    fn get_data(&self, offset: usize, limit: usize)
    -> BoxFuture<'_, Result<Vec<serde_json::Value>>>;

    /// Total number of stored items.
    fn item_count(&self) -> BoxFuture<'_, Result<usize>>;
}

/// Process-local dataset backed by a `Vec`.
#[derive(Debug, Default)]
pub struct MemoryDataset {
    items: RwLock<Vec<serde_json::Value>>,
}

impl MemoryDataset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Dataset for MemoryDataset {
    fn push_data(&self, items: Vec<serde_json::Value>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.items.write().extend(items);
            Ok(())
        })
    }

    fn get_data(
        &self,
        offset: usize,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<serde_json::Value>>> {
        Box::pin(async move {
            let items = self.items.read();
            Ok(items.iter().skip(offset).take(limit).cloned().collect())
        })
    }

    fn item_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(self.items.read().len()) })
    }
}
