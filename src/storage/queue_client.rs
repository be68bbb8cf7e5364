//! Request-queue storage client contract and in-memory implementation
//!
//! The client owns the persistent truth of the queue: records keyed by
//! unique key, a total order over unhandled records, and time-bounded locks
//! held by consumers between fetch and handled/reclaim.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::request::Request;

/// Outcome of inserting a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRequestResult {
    pub request_id: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// A request the backend could not accept in a batch insert.
#[derive(Debug, Clone)]
pub struct UnprocessedRequest {
    pub request: Request,
    pub reason: String,
}

/// Outcome of a batch insert.
#[derive(Debug, Default)]
pub struct BatchAddResult {
    pub processed: Vec<AddRequestResult>,
    pub unprocessed: Vec<UnprocessedRequest>,
}

/// Storage contract an external queue backend fulfils.
///
/// Ordering: smaller `order_no` is served first. Forefront inserts assign a
/// value less than any existing; normal inserts a value greater than any
/// existing. Locks expire lazily: an expired lock makes the record
/// reassignable while preserving its original order.
pub trait RequestQueueClient: Send + Sync {
    fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> BoxFuture<'_, Result<AddRequestResult>>;

    fn batch_add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> BoxFuture<'_, Result<BatchAddResult>>;

    fn get_request<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Request>>>;

    /// Update a stored record. With `forefront`, re-promote it to the front.
    fn update_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> BoxFuture<'_, Result<AddRequestResult>>;

    /// Head of the queue in order, ignoring locks.
    fn list_head(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Request>>>;

    /// Head of the queue in order, skipping locked records and locking the
    /// returned ones for `lock_secs`.
    fn list_and_lock_head(
        &self,
        limit: usize,
        lock_secs: u64,
    ) -> BoxFuture<'_, Result<Vec<Request>>>;

    fn prolong_request_lock<'a>(
        &'a self,
        id: &'a str,
        lock_secs: u64,
        forefront: bool,
    ) -> BoxFuture<'a, Result<()>>;

    fn delete_request_lock<'a>(
        &'a self,
        id: &'a str,
        forefront: bool,
    ) -> BoxFuture<'a, Result<()>>;

    /// Count of records with `handled_at` set.
    fn handled_count(&self) -> BoxFuture<'_, Result<usize>>;

    /// Total number of records ever inserted.
    fn total_count(&self) -> BoxFuture<'_, Result<usize>>;
}

#[derive(Debug)]
struct StoredRecord {
    request: Request,
    order_no: i64,
    lock_expires_at: Option<Instant>,
}

impl StoredRecord {
    fn is_locked(&self, now: Instant) -> bool {
        self.lock_expires_at.is_some_and(|expires| expires > now)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    records: HashMap<String, StoredRecord>,
    by_unique_key: HashMap<String, String>,
    handled_count: usize,
}

/// Process-local queue backend.
///
/// Order numbers are derived from a monotonic clock: forefront inserts take
/// the negated timestamp so later forefront inserts sort before earlier
/// ones, normal inserts take the positive timestamp. A per-insert sequence
/// breaks ties within one clock tick.
#[derive(Debug)]
pub struct MemoryQueueClient {
    state: Mutex<QueueState>,
    epoch: Instant,
    sequence: AtomicI64,
}

impl Default for MemoryQueueClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            epoch: Instant::now(),
            sequence: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn next_order_no(&self, forefront: bool) -> i64 {
        let micros = self.epoch.elapsed().as_micros() as i64;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) & 0x3ff;
        let stamp = (micros << 10) | seq;
        if forefront { -stamp } else { stamp }
    }

    fn add_request_sync(&self, mut request: Request, forefront: bool) -> AddRequestResult {
        let order_no = self.next_order_no(forefront);
        let mut state = self.state.lock();

        if let Some(id) = state.by_unique_key.get(&request.unique_key).cloned()
            && let Some(record) = state.records.get_mut(&id)
        {
            let was_already_handled = record.request.is_handled();
            if !was_already_handled && forefront {
                record.order_no = order_no;
            }
            return AddRequestResult {
                request_id: id,
                was_already_present: true,
                was_already_handled,
            };
        }

        let id = Uuid::new_v4().to_string();
        request.id = Some(id.clone());
        let was_already_handled = request.is_handled();
        if was_already_handled {
            state.handled_count += 1;
        }
        state
            .by_unique_key
            .insert(request.unique_key.clone(), id.clone());
        state.records.insert(
            id.clone(),
            StoredRecord {
                request,
                order_no,
                lock_expires_at: None,
            },
        );

        AddRequestResult {
            request_id: id,
            was_already_present: false,
            was_already_handled,
        }
    }

    fn head_ids(state: &QueueState, limit: usize, skip_locked: bool, now: Instant) -> Vec<String> {
        let mut candidates: Vec<(&String, &StoredRecord)> = state
            .records
            .iter()
            .filter(|(_, record)| !record.request.is_handled())
            .filter(|(_, record)| !skip_locked || !record.is_locked(now))
            .collect();
        candidates.sort_by_key(|(_, record)| record.order_no);
        candidates
            .into_iter()
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl RequestQueueClient for MemoryQueueClient {
    fn add_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> BoxFuture<'_, Result<AddRequestResult>> {
        Box::pin(async move { Ok(self.add_request_sync(request, forefront)) })
    }

    fn batch_add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> BoxFuture<'_, Result<BatchAddResult>> {
        Box::pin(async move {
            let mut result = BatchAddResult::default();
            for request in requests {
                result
                    .processed
                    .push(self.add_request_sync(request, forefront));
            }
            Ok(result)
        })
    }

    fn get_request<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Request>>> {
        Box::pin(async move {
            let state = self.state.lock();
            Ok(state.records.get(id).map(|record| record.request.clone()))
        })
    }

    fn update_request(
        &self,
        request: Request,
        forefront: bool,
    ) -> BoxFuture<'_, Result<AddRequestResult>> {
        Box::pin(async move {
            let order_no = self.next_order_no(forefront);
            let Some(id) = request.id.clone() else {
                anyhow::bail!("cannot update a request without an id");
            };

            let mut state = self.state.lock();
            let Some(record) = state.records.get_mut(&id) else {
                anyhow::bail!("request {id} not found in queue");
            };

            let was_handled = record.request.is_handled();
            let is_handled_now = request.is_handled();
            record.request = request;
            if forefront && !is_handled_now {
                record.order_no = order_no;
            }
            if !was_handled && is_handled_now {
                state.handled_count += 1;
            }

            Ok(AddRequestResult {
                request_id: id,
                was_already_present: true,
                was_already_handled: was_handled,
            })
        })
    }

    fn list_head(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Request>>> {
        Box::pin(async move {
            let state = self.state.lock();
            let ids = Self::head_ids(&state, limit, false, Instant::now());
            Ok(ids
                .iter()
                .filter_map(|id| state.records.get(id).map(|r| r.request.clone()))
                .collect())
        })
    }

    fn list_and_lock_head(
        &self,
        limit: usize,
        lock_secs: u64,
    ) -> BoxFuture<'_, Result<Vec<Request>>> {
        Box::pin(async move {
            let now = Instant::now();
            let expires = now + Duration::from_secs(lock_secs);
            let mut state = self.state.lock();
            let ids = Self::head_ids(&state, limit, true, now);

            let mut locked = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(record) = state.records.get_mut(&id) {
                    record.lock_expires_at = Some(expires);
                    locked.push(record.request.clone());
                }
            }
            Ok(locked)
        })
    }

    fn prolong_request_lock<'a>(
        &'a self,
        id: &'a str,
        lock_secs: u64,
        forefront: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let order_no = self.next_order_no(forefront);
            let mut state = self.state.lock();
            let Some(record) = state.records.get_mut(id) else {
                anyhow::bail!("request {id} not found in queue");
            };
            record.lock_expires_at = Some(Instant::now() + Duration::from_secs(lock_secs));
            if forefront {
                record.order_no = order_no;
            }
            Ok(())
        })
    }

    fn delete_request_lock<'a>(
        &'a self,
        id: &'a str,
        forefront: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let order_no = self.next_order_no(forefront);
            let mut state = self.state.lock();
            let Some(record) = state.records.get_mut(id) else {
                anyhow::bail!("request {id} not found in queue");
            };
            record.lock_expires_at = None;
            if forefront {
                record.order_no = order_no;
            }
            Ok(())
        })
    }

    fn handled_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(self.state.lock().handled_count) })
    }

    fn total_count(&self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move { Ok(self.state.lock().records.len()) })
    }
}

/// Mark a request handled, stamping `handled_at` if unset.
///
/// Shared helper so queue and list agree on what "handled" means.
pub(crate) fn stamp_handled(request: &mut Request) {
    if request.handled_at.is_none() {
        request.handled_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forefront_insert_is_served_first() {
        let client = MemoryQueueClient::new();
        client
            .add_request(Request::new("https://a/1"), false)
            .await
            .expect("add");
        client
            .add_request(Request::new("https://a/2"), true)
            .await
            .expect("add");

        let head = client.list_and_lock_head(10, 60).await.expect("head");
        let urls: Vec<&str> = head.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a/2", "https://a/1"]);
    }

    #[tokio::test]
    async fn duplicate_unique_key_returns_existing_record() {
        let client = MemoryQueueClient::new();
        let first = client
            .add_request(Request::new("https://a/x").with_unique_key("K"), false)
            .await
            .expect("add");
        let second = client
            .add_request(Request::new("https://a/x").with_unique_key("K"), false)
            .await
            .expect("add");

        assert!(!first.was_already_present);
        assert!(second.was_already_present);
        assert_eq!(first.request_id, second.request_id);
        assert_eq!(client.total_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn locked_records_are_skipped_until_expiry() {
        let client = MemoryQueueClient::new();
        client
            .add_request(Request::new("https://a/1"), false)
            .await
            .expect("add");

        let first = client.list_and_lock_head(10, 60).await.expect("head");
        assert_eq!(first.len(), 1);

        // Still locked: nothing to hand out.
        let second = client.list_and_lock_head(10, 60).await.expect("head");
        assert!(second.is_empty());

        let id = first[0].id.clone().expect("id assigned");
        client
            .delete_request_lock(&id, false)
            .await
            .expect("unlock");
        let third = client.list_and_lock_head(10, 60).await.expect("head");
        assert_eq!(third.len(), 1);
    }

    #[tokio::test]
    async fn expired_lock_preserves_original_order() {
        let client = MemoryQueueClient::new();
        client
            .add_request(Request::new("https://a/1"), false)
            .await
            .expect("add");
        client
            .add_request(Request::new("https://a/2"), false)
            .await
            .expect("add");

        // Zero-second lock expires immediately.
        let locked = client.list_and_lock_head(1, 0).await.expect("head");
        assert_eq!(locked[0].url, "https://a/1");

        let head = client.list_and_lock_head(10, 60).await.expect("head");
        let urls: Vec<&str> = head.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a/1", "https://a/2"]);
    }
}
