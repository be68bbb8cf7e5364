//! Storage Interfaces
//!
//! Abstract contracts for the key-value store, dataset and request-queue
//! backends, plus the in-memory reference implementations used by tests and
//! single-process runs. Filesystem and cloud backends live outside this
//! crate and only need to satisfy these traits.

pub mod dataset;
pub mod kv;
pub mod queue_client;

pub use dataset::{Dataset, MemoryDataset};
pub use kv::{KeyValueStore, MemoryKeyValueStore};
pub use queue_client::{
    AddRequestResult, BatchAddResult, MemoryQueueClient, RequestQueueClient, UnprocessedRequest,
};

/// KV key for persisted crawler statistics, parameterized by crawler id.
#[must_use]
pub fn statistics_key(id: u32) -> String {
    format!("SDK_CRAWLER_STATISTICS_{id}")
}

/// KV key for the persisted session pool.
pub const SESSION_POOL_STATE_KEY: &str = "SDK_SESSION_POOL_STATE";

/// KV key for user-held shared state exposed through `use_state`.
pub const SHARED_STATE_KEY: &str = "CRAWLEE_STATE";

/// KV key for a named request list's persisted state.
#[must_use]
pub fn request_list_state_key(name: &str) -> String {
    format!("{name}-REQUEST_LIST_STATE")
}

/// KV key for a named request list's materialized sources.
#[must_use]
pub fn request_list_sources_key(name: &str) -> String {
    format!("{name}-REQUEST_LIST_SOURCES")
}
