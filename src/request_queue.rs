//! Dynamic, deduplicated, lockable request queue
//!
//! The queue front-ends a [`RequestQueueClient`] backend with a bounded head
//! cache for O(1) fetches, client-side progress accounting, and time-boxed,
//! retried backend calls. Records move `PENDING → LOCKED → (HANDLED |
//! PENDING)`; `HANDLED` is terminal.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use dashmap::DashSet;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::request::Request;
use crate::storage::queue_client::stamp_handled;
use crate::storage::{AddRequestResult, MemoryQueueClient, RequestQueueClient, UnprocessedRequest};
use crate::utils::with_timeout_retried;

/// Maximum records kept in the in-memory head cache.
const MAX_HEAD_CACHE_SIZE: usize = 1000;

/// Maximum requests per backend batch-insert call.
const MAX_BATCH_SIZE: usize = 1000;

/// Delay before re-submitting requests a batch insert could not process.
const BATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Attempts for a backend operation that keeps timing out.
const OP_TIMEOUT_RETRIES: u32 = 3;

/// Tuning knobs for a [`RequestQueue`].
#[derive(Debug, Clone)]
pub struct RequestQueueOptions {
    /// Lock duration assigned to fetched requests.
    pub lock_secs: u64,
    /// Deadline for one backend operation before it is retried.
    pub op_timeout: Duration,
}

impl Default for RequestQueueOptions {
    fn default() -> Self {
        Self {
            lock_secs: 60,
            op_timeout: Duration::from_secs(300),
        }
    }
}

/// Deduplicated queue with forefront priority and request locks.
pub struct RequestQueue {
    client: Arc<dyn RequestQueueClient>,
    options: RequestQueueOptions,
    /// Locked records fetched from the backend, awaiting hand-out.
    head: Mutex<VecDeque<Request>>,
    /// Ids handed out to consumers and not yet handled or reclaimed.
    in_progress: DashSet<String>,
    /// Records this queue instance believes exist / are handled; used to
    /// decide whether an empty head cache can be trusted.
    assumed_total: AtomicUsize,
    assumed_handled: AtomicUsize,
    /// Batch-add operations still retrying unprocessed entries.
    pending_adds: AtomicUsize,
}

impl RequestQueue {
    #[must_use]
    pub fn new(client: Arc<dyn RequestQueueClient>, options: RequestQueueOptions) -> Self {
        Self {
            client,
            options,
            head: Mutex::new(VecDeque::new()),
            in_progress: DashSet::new(),
            assumed_total: AtomicUsize::new(0),
            assumed_handled: AtomicUsize::new(0),
            pending_adds: AtomicUsize::new(0),
        }
    }

    /// Queue backed by a process-local in-memory client.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryQueueClient::shared(), RequestQueueOptions::default())
    }

    #[must_use]
    pub fn with_options(mut self, options: RequestQueueOptions) -> Self {
        self.options = options;
        self
    }

    /// Insert one request, deduplicating by `unique_key`.
    ///
    /// An unhandled duplicate keeps its position unless `forefront` is set,
    /// which re-promotes it; a handled duplicate is returned unchanged.
    pub async fn add_request(&self, request: Request, forefront: bool) -> Result<AddRequestResult> {
        if forefront {
            self.flush_head_cache().await;
        }
        let result = with_timeout_retried(
            || self.client.add_request(request.clone(), forefront),
            self.options.op_timeout,
            OP_TIMEOUT_RETRIES,
            "queue add_request",
        )
        .await?;

        if !result.was_already_present {
            self.assumed_total.fetch_add(1, Ordering::Relaxed);
            if result.was_already_handled {
                self.assumed_handled.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(result)
    }

    /// Insert many requests in batches of up to 1000.
    ///
    /// Entries the backend reports as unprocessed are re-submitted after a
    /// one-second pause until none remain.
    pub async fn batch_add_requests(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>> {
        if forefront {
            self.flush_head_cache().await;
        }
        self.pending_adds.fetch_add(1, Ordering::SeqCst);
        let result = self.batch_add_inner(requests, forefront).await;
        self.pending_adds.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn batch_add_inner(
        &self,
        requests: Vec<Request>,
        forefront: bool,
    ) -> Result<Vec<AddRequestResult>> {
        let mut remaining = requests;
        let mut processed = Vec::new();

        while !remaining.is_empty() {
            let mut unprocessed: Vec<UnprocessedRequest> = Vec::new();
            for chunk in remaining.chunks(MAX_BATCH_SIZE) {
                let chunk = chunk.to_vec();
                let batch = with_timeout_retried(
                    || self.client.batch_add_requests(chunk.clone(), forefront),
                    self.options.op_timeout,
                    OP_TIMEOUT_RETRIES,
                    "queue batch_add_requests",
                )
                .await?;

                for item in &batch.processed {
                    if !item.was_already_present {
                        self.assumed_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
                processed.extend(batch.processed);
                unprocessed.extend(batch.unprocessed);
            }

            if unprocessed.is_empty() {
                break;
            }
            warn!(
                "backend left {} request(s) unprocessed, retrying in {:?}",
                unprocessed.len(),
                BATCH_RETRY_DELAY
            );
            tokio::time::sleep(BATCH_RETRY_DELAY).await;
            remaining = unprocessed.into_iter().map(|u| u.request).collect();
        }

        Ok(processed)
    }

    /// Fetch the next request, locking it for this consumer.
    ///
    /// Returns `None` when no unhandled, unlocked record exists right now.
    pub async fn fetch_next_request(&self) -> Result<Option<Request>> {
        if let Some(request) = self.pop_cached() {
            return Ok(Some(request));
        }

        self.refill_head_cache().await?;

        if let Some(request) = self.pop_cached() {
            return Ok(Some(request));
        }
        if !self.is_head_consistent() {
            debug!("queue head cache looks stale, will refill on next fetch");
        }
        Ok(None)
    }

    fn pop_cached(&self) -> Option<Request> {
        let mut head = self.head.lock();
        while let Some(request) = head.pop_front() {
            let Some(id) = request.id.clone() else {
                continue;
            };
            // A record can reappear in the head if its lock expired while we
            // still consider it leased; skip those.
            if self.in_progress.insert(id) {
                return Some(request);
            }
        }
        None
    }

    async fn refill_head_cache(&self) -> Result<()> {
        let fetched = with_timeout_retried(
            || {
                self.client
                    .list_and_lock_head(MAX_HEAD_CACHE_SIZE, self.options.lock_secs)
            },
            self.options.op_timeout,
            OP_TIMEOUT_RETRIES,
            "queue list_and_lock_head",
        )
        .await?;

        let mut head = self.head.lock();
        for request in fetched {
            let already_leased = request
                .id
                .as_deref()
                .is_some_and(|id| self.in_progress.contains(id));
            if !already_leased {
                head.push_back(request);
            }
        }
        Ok(())
    }

    /// Mark a request terminally handled and release its lock.
    pub async fn mark_request_handled(&self, mut request: Request) -> Result<AddRequestResult> {
        stamp_handled(&mut request);
        let id = request.id.clone();
        let result = with_timeout_retried(
            || self.client.update_request(request.clone(), false),
            self.options.op_timeout,
            OP_TIMEOUT_RETRIES,
            "queue mark_request_handled",
        )
        .await?;

        if let Some(id) = id {
            let _ = self
                .client
                .delete_request_lock(&id, false)
                .await
                .inspect_err(|err| debug!("releasing lock after handled failed: {err}"));
            self.in_progress.remove(&id);
        }
        self.assumed_handled.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Return a leased request to the queue for another attempt.
    ///
    /// Persists any mutation the consumer made (retry count, error messages)
    /// and releases the lock; with `forefront` the record jumps the line.
    pub async fn reclaim_request(&self, request: Request, forefront: bool) -> Result<()> {
        let id = request.id.clone();
        with_timeout_retried(
            || self.client.update_request(request.clone(), forefront),
            self.options.op_timeout,
            OP_TIMEOUT_RETRIES,
            "queue reclaim_request",
        )
        .await?;

        if let Some(id) = id {
            with_timeout_retried(
                || self.client.delete_request_lock(&id, forefront),
                self.options.op_timeout,
                OP_TIMEOUT_RETRIES,
                "queue delete_request_lock",
            )
            .await?;
            self.in_progress.remove(&id);
        }
        Ok(())
    }

    /// Extend the lock on a leased request.
    pub async fn prolong_request_lock(
        &self,
        id: &str,
        lock_secs: u64,
        forefront: bool,
    ) -> Result<()> {
        with_timeout_retried(
            || self.client.prolong_request_lock(id, lock_secs, forefront),
            self.options.op_timeout,
            OP_TIMEOUT_RETRIES,
            "queue prolong_request_lock",
        )
        .await
    }

    /// Drop the lock on a leased request without reclaiming or handling it.
    pub async fn delete_request_lock(&self, id: &str, forefront: bool) -> Result<()> {
        with_timeout_retried(
            || self.client.delete_request_lock(id, forefront),
            self.options.op_timeout,
            OP_TIMEOUT_RETRIES,
            "queue delete_request_lock",
        )
        .await?;
        self.in_progress.remove(id);
        Ok(())
    }

    /// True when no unhandled record is available, ignoring in-progress ones.
    pub async fn is_empty(&self) -> Result<bool> {
        if !self.head.lock().is_empty() {
            return Ok(false);
        }
        let head = self.client.list_head(MAX_HEAD_CACHE_SIZE).await?;
        Ok(head.iter().all(|request| {
            request
                .id
                .as_deref()
                .is_some_and(|id| self.in_progress.contains(id))
        }))
    }

    /// True when the queue is empty, nothing is in progress and no batch
    /// insert is still retrying.
    pub async fn is_finished(&self) -> Result<bool> {
        if self.pending_adds.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        if !self.in_progress.is_empty() {
            return Ok(false);
        }
        self.is_empty().await
    }

    /// Count of terminally handled requests.
    pub async fn handled_count(&self) -> Result<usize> {
        self.client.handled_count().await
    }

    /// Total records ever inserted.
    pub async fn total_count(&self) -> Result<usize> {
        self.client.total_count().await
    }

    /// Number of requests currently leased to consumers.
    #[must_use]
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    /// Release every cached head lock, emptying the cache.
    ///
    /// Called before forefront inserts (so the new front is actually served
    /// next) and on shutdown so no record stays locked.
    pub async fn flush_head_cache(&self) {
        let drained: Vec<Request> = {
            let mut head = self.head.lock();
            head.drain(..).collect()
        };
        for request in drained {
            if let Some(id) = request.id.as_deref()
                && let Err(err) = self.client.delete_request_lock(id, false).await
            {
                debug!("failed to release cached lock for {id}: {err}");
            }
        }
    }

    /// Head consistency: the cache can be trusted as long as what we assume
    /// handled, leased and cached covers everything we assume exists.
    fn is_head_consistent(&self) -> bool {
        let assumed_total = self.assumed_total.load(Ordering::Relaxed);
        let assumed_handled = self.assumed_handled.load(Ordering::Relaxed);
        let covered = assumed_handled + self.in_progress.len() + self.head.lock().len();
        covered >= assumed_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> RequestQueue {
        RequestQueue::in_memory()
    }

    #[tokio::test]
    async fn add_fetch_handle_round_trip() {
        let queue = queue();
        queue
            .add_request(Request::new("https://a/1"), false)
            .await
            .expect("add");

        let fetched = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("request available");
        assert_eq!(fetched.url, "https://a/1");
        assert_eq!(queue.in_progress_count(), 1);

        queue
            .mark_request_handled(fetched)
            .await
            .expect("mark handled");
        assert_eq!(queue.in_progress_count(), 0);
        assert_eq!(queue.handled_count().await.expect("count"), 1);
        assert!(queue.is_finished().await.expect("finished"));
    }

    #[tokio::test]
    async fn duplicate_add_is_idempotent() {
        let queue = queue();
        let first = queue
            .add_request(Request::new("https://a/x").with_unique_key("K"), false)
            .await
            .expect("add");
        let second = queue
            .add_request(Request::new("https://a/x").with_unique_key("K"), false)
            .await
            .expect("add");

        assert!(!first.was_already_present);
        assert!(second.was_already_present);

        // Served exactly once.
        assert!(
            queue
                .fetch_next_request()
                .await
                .expect("fetch")
                .is_some()
        );
        assert!(
            queue
                .fetch_next_request()
                .await
                .expect("fetch")
                .is_none()
        );
    }

    #[tokio::test]
    async fn forefront_add_is_served_before_earlier_requests() {
        let queue = queue();
        queue
            .add_request(Request::new("https://a/1"), false)
            .await
            .expect("add");
        queue
            .add_request(Request::new("https://a/2"), true)
            .await
            .expect("add");

        let first = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("available");
        let second = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("available");
        assert_eq!(first.url, "https://a/2");
        assert_eq!(second.url, "https://a/1");
    }

    #[tokio::test]
    async fn forefront_add_beats_already_cached_head() {
        let queue = queue();
        queue
            .add_request(Request::new("https://a/1"), false)
            .await
            .expect("add");
        queue
            .add_request(Request::new("https://a/2"), false)
            .await
            .expect("add");

        // Prime the head cache.
        let first = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("available");
        assert_eq!(first.url, "https://a/1");

        queue
            .add_request(Request::new("https://a/3"), true)
            .await
            .expect("add");

        let next = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("available");
        assert_eq!(next.url, "https://a/3");
    }

    #[tokio::test]
    async fn reclaim_returns_request_for_refetch() {
        let queue = queue();
        queue
            .add_request(Request::new("https://a/1"), false)
            .await
            .expect("add");

        let mut fetched = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("available");
        fetched.retry_count += 1;
        queue
            .reclaim_request(fetched, false)
            .await
            .expect("reclaim");

        let again = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("available after reclaim");
        assert_eq!(again.retry_count, 1);
    }

    #[tokio::test]
    async fn is_finished_tracks_in_progress() {
        let queue = queue();
        queue
            .add_request(Request::new("https://a/1"), false)
            .await
            .expect("add");
        assert!(!queue.is_finished().await.expect("finished"));

        let fetched = queue
            .fetch_next_request()
            .await
            .expect("fetch")
            .expect("available");
        // Empty ignoring in-progress, but not finished.
        assert!(queue.is_empty().await.expect("empty"));
        assert!(!queue.is_finished().await.expect("finished"));

        queue
            .mark_request_handled(fetched)
            .await
            .expect("mark handled");
        assert!(queue.is_finished().await.expect("finished"));
    }
}
