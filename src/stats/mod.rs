//! Per-crawl statistics: timings, retry histogram, error clustering
//!
//! Statistics survive process restarts: the persisted snapshot carries the
//! accumulated runtime, and a reloaded instance keeps the runtime continuous
//! so rate calculations are unaffected by the gap.

pub mod error_tracker;

pub use error_tracker::{ErrorGroup, ErrorSnapshot, ErrorTracker};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::events::{EventBus, SystemEvent};
use crate::storage::{KeyValueStore, statistics_key};

#[derive(Debug)]
struct JobRecord {
    started_at: Instant,
    retry_count: u32,
}

#[derive(Debug)]
struct StatsInner {
    requests_finished: u64,
    requests_failed: u64,
    requests_retries: u64,
    finished_duration_millis: u64,
    failed_duration_millis: u64,
    min_finished_millis: Option<u64>,
    max_finished_millis: u64,
    min_failed_millis: Option<u64>,
    max_failed_millis: u64,
    status_code_counts: BTreeMap<u16, u64>,
    retry_histogram: Vec<u64>,
    jobs: HashMap<String, JobRecord>,
    instance_start: Instant,
    /// Runtime accumulated by previous incarnations of this crawler.
    runtime_offset_millis: u64,
    crawl_started_at: DateTime<Utc>,
    crawl_finished_at: Option<DateTime<Utc>>,
}

impl Default for StatsInner {
    fn default() -> Self {
        Self {
            requests_finished: 0,
            requests_failed: 0,
            requests_retries: 0,
            finished_duration_millis: 0,
            failed_duration_millis: 0,
            min_finished_millis: None,
            max_finished_millis: 0,
            min_failed_millis: None,
            max_failed_millis: 0,
            status_code_counts: BTreeMap::new(),
            retry_histogram: Vec::new(),
            jobs: HashMap::new(),
            instance_start: Instant::now(),
            runtime_offset_millis: 0,
            crawl_started_at: Utc::now(),
            crawl_finished_at: None,
        }
    }
}

/// Serializable snapshot of the statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsState {
    pub requests_finished: u64,
    pub requests_failed: u64,
    pub requests_retries: u64,
    pub requests_total: u64,
    pub request_total_duration_millis: u64,
    pub request_avg_finished_duration_millis: Option<u64>,
    pub request_avg_failed_duration_millis: Option<u64>,
    pub request_min_duration_millis: Option<u64>,
    pub request_max_duration_millis: u64,
    pub request_min_failed_duration_millis: Option<u64>,
    pub request_max_failed_duration_millis: u64,
    pub requests_finished_per_minute: f64,
    pub retry_histogram: Vec<u64>,
    pub status_code_distribution: BTreeMap<u16, u64>,
    pub crawler_runtime_millis: u64,
    pub crawler_started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_finished_at: Option<DateTime<Utc>>,
    pub stats_persisted_at: DateTime<Utc>,
}

/// Per-crawl counters plus the retry and final error trackers.
pub struct Statistics {
    id: u32,
    kv: Option<Arc<dyn KeyValueStore>>,
    inner: Mutex<StatsInner>,
    error_tracker: Mutex<ErrorTracker>,
    error_tracker_retry: Mutex<ErrorTracker>,
}

impl Statistics {
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self {
            id,
            kv: None,
            inner: Mutex::new(StatsInner::default()),
            error_tracker: Mutex::new(ErrorTracker::new()),
            error_tracker_retry: Mutex::new(ErrorTracker::new()),
        }
    }

    /// Attach the key-value store used for persistence.
    #[must_use]
    pub fn with_kv_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Restore persisted counters so rates stay continuous across restarts.
    pub async fn initialize(&self) -> Result<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let key = statistics_key(self.id);
        let Some(value) = kv.get_value(&key).await? else {
            return Ok(());
        };
        let state: StatisticsState =
            serde_json::from_value(value).context("persisted statistics are corrupt")?;

        let mut inner = self.inner.lock();
        inner.requests_finished = state.requests_finished;
        inner.requests_failed = state.requests_failed;
        inner.requests_retries = state.requests_retries;
        inner.retry_histogram = state.retry_histogram;
        inner.status_code_counts = state.status_code_distribution;
        inner.min_finished_millis = state.request_min_duration_millis;
        inner.max_finished_millis = state.request_max_duration_millis;
        inner.finished_duration_millis = state.request_total_duration_millis;
        inner.crawl_started_at = state.crawler_started_at;
        // Resuming resets the wall clock but not the accumulated runtime:
        // the new instance keeps counting from where the old one stopped.
        inner.runtime_offset_millis = state.crawler_runtime_millis;
        inner.instance_start = Instant::now();
        info!(
            "statistics resumed: {} finished, {} failed, runtime {}ms",
            state.requests_finished, state.requests_failed, state.crawler_runtime_millis
        );
        Ok(())
    }

    /// Record the start of one handling attempt.
    pub fn start_job(&self, id: &str, retry_count: u32) {
        let mut inner = self.inner.lock();
        inner.jobs.insert(
            id.to_string(),
            JobRecord {
                started_at: Instant::now(),
                retry_count,
            },
        );
    }

    /// Record a successful completion; updates the retry histogram.
    pub fn finish_job(&self, id: &str) {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.remove(id) else {
            warn!("finish_job called for unknown job {id}");
            return;
        };
        let millis = job.started_at.elapsed().as_millis() as u64;
        inner.requests_finished += 1;
        inner.finished_duration_millis += millis;
        inner.max_finished_millis = inner.max_finished_millis.max(millis);
        inner.min_finished_millis = Some(match inner.min_finished_millis {
            Some(min) => min.min(millis),
            None => millis,
        });

        let bucket = job.retry_count as usize;
        if inner.retry_histogram.len() <= bucket {
            inner.retry_histogram.resize(bucket + 1, 0);
        }
        inner.retry_histogram[bucket] += 1;
    }

    /// Record a final failure.
    pub fn fail_job(&self, id: &str) {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.remove(id) else {
            warn!("fail_job called for unknown job {id}");
            return;
        };
        let millis = job.started_at.elapsed().as_millis() as u64;
        inner.requests_failed += 1;
        inner.failed_duration_millis += millis;
        inner.max_failed_millis = inner.max_failed_millis.max(millis);
        inner.min_failed_millis = Some(match inner.min_failed_millis {
            Some(min) => min.min(millis),
            None => millis,
        });
    }

    /// Record one retry (a request reclaimed for another attempt).
    pub fn track_retry(&self) {
        self.inner.lock().requests_retries += 1;
    }

    /// Record a response status code.
    pub fn track_status_code(&self, status: u16) {
        *self
            .inner
            .lock()
            .status_code_counts
            .entry(status)
            .or_insert(0) += 1;
    }

    /// Record an error that led to a retry.
    pub fn add_retry_error(&self, err: &anyhow::Error) {
        self.error_tracker_retry.lock().add_error(err);
    }

    /// Record an error that led to a final failure.
    pub fn add_final_error(&self, err: &anyhow::Error) {
        self.error_tracker.lock().add_error(err);
    }

    #[must_use]
    pub fn retry_error_total(&self) -> u64 {
        self.error_tracker_retry.lock().total()
    }

    #[must_use]
    pub fn final_error_total(&self) -> u64 {
        self.error_tracker.lock().total()
    }

    /// The `n` most frequent final-failure error groups.
    #[must_use]
    pub fn most_popular_errors(&self, n: usize) -> Vec<ErrorGroup> {
        self.error_tracker.lock().most_popular_errors(n)
    }

    /// Stamp the crawl as finished.
    pub fn finalize(&self) {
        let mut inner = self.inner.lock();
        if inner.crawl_finished_at.is_none() {
            inner.crawl_finished_at = Some(Utc::now());
        }
    }

    /// Total runtime including previous incarnations.
    #[must_use]
    pub fn runtime_millis(&self) -> u64 {
        let inner = self.inner.lock();
        inner.runtime_offset_millis + inner.instance_start.elapsed().as_millis() as u64
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn state(&self) -> StatisticsState {
        let inner = self.inner.lock();
        let runtime_millis =
            inner.runtime_offset_millis + inner.instance_start.elapsed().as_millis() as u64;
        let finished = inner.requests_finished;
        let per_minute = if runtime_millis == 0 {
            0.0
        } else {
            finished as f64 / (runtime_millis as f64 / 60_000.0)
        };

        StatisticsState {
            requests_finished: finished,
            requests_failed: inner.requests_failed,
            requests_retries: inner.requests_retries,
            requests_total: finished + inner.requests_failed,
            request_total_duration_millis: inner.finished_duration_millis,
            request_avg_finished_duration_millis: (finished > 0)
                .then(|| inner.finished_duration_millis / finished),
            request_avg_failed_duration_millis: (inner.requests_failed > 0)
                .then(|| inner.failed_duration_millis / inner.requests_failed),
            request_min_duration_millis: inner.min_finished_millis,
            request_max_duration_millis: inner.max_finished_millis,
            request_min_failed_duration_millis: inner.min_failed_millis,
            request_max_failed_duration_millis: inner.max_failed_millis,
            requests_finished_per_minute: per_minute,
            retry_histogram: inner.retry_histogram.clone(),
            status_code_distribution: inner.status_code_counts.clone(),
            crawler_runtime_millis: runtime_millis,
            crawler_started_at: inner.crawl_started_at,
            crawler_finished_at: inner.crawl_finished_at,
            stats_persisted_at: Utc::now(),
        }
    }

    /// Write the snapshot to the key-value store.
    pub async fn persist_state(&self) -> Result<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let key = statistics_key(self.id);
        kv.set_value(&key, serde_json::to_value(self.state())?).await
    }

    /// Persist on every `PersistState` event until the bus closes.
    pub fn listen(self: Arc<Self>, bus: &Arc<EventBus>) -> JoinHandle<()> {
        let stats = self;
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                if matches!(
                    event,
                    SystemEvent::PersistState { .. } | SystemEvent::Migrating
                ) && let Err(err) = stats.persist_state().await
                {
                    warn!("statistics persistence failed: {err}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;
    use std::time::Duration;

    #[test]
    fn finish_fills_retry_histogram_bucket() {
        let stats = Statistics::new(0);
        stats.start_job("r1", 3);
        stats.finish_job("r1");
        stats.start_job("r2", 0);
        stats.finish_job("r2");

        let state = stats.state();
        assert_eq!(state.requests_finished, 2);
        assert_eq!(state.retry_histogram, vec![1, 0, 0, 1]);
    }

    #[test]
    fn fail_counts_separately_from_finish() {
        let stats = Statistics::new(0);
        stats.start_job("ok", 0);
        stats.finish_job("ok");
        stats.start_job("bad", 1);
        stats.fail_job("bad");

        let state = stats.state();
        assert_eq!(state.requests_finished, 1);
        assert_eq!(state.requests_failed, 1);
        assert_eq!(state.requests_total, 2);
        // Failed jobs do not contribute to the retry histogram.
        assert_eq!(state.retry_histogram, vec![1]);
    }

    #[tokio::test]
    async fn persisted_state_keeps_runtime_continuous() {
        let kv = MemoryKeyValueStore::shared();
        let stats = Statistics::new(7).with_kv_store(kv.clone());
        stats.start_job("r1", 0);
        stats.finish_job("r1");

        tokio::time::sleep(Duration::from_millis(30)).await;
        stats.persist_state().await.expect("persist");
        let persisted_runtime = stats.state().crawler_runtime_millis;

        let resumed = Statistics::new(7).with_kv_store(kv);
        resumed.initialize().await.expect("initialize");

        assert_eq!(resumed.state().requests_finished, 1);
        assert!(
            resumed.runtime_millis() >= persisted_runtime,
            "runtime must not go backwards across restart"
        );
    }

    #[test]
    fn status_codes_accumulate() {
        let stats = Statistics::new(0);
        stats.track_status_code(200);
        stats.track_status_code(200);
        stats.track_status_code(429);

        let state = stats.state();
        assert_eq!(state.status_code_distribution.get(&200), Some(&2));
        assert_eq!(state.status_code_distribution.get(&429), Some(&1));
    }
}
