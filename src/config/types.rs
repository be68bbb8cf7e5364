//! Core configuration types for the crawling engine
//!
//! This module contains the main `CrawlerConfig` struct and its associated
//! types. Use [`CrawlerConfig::builder`] to construct one with validation.

use serde::{Deserialize, Serialize};

/// Configuration of the session pool and its sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPoolConfig {
    /// Upper bound on the number of live sessions.
    pub(crate) max_pool_size: usize,
    /// A session is retired after this many checkouts.
    pub(crate) max_usage_count: u32,
    /// A session is retired once its error score reaches this value.
    pub(crate) max_error_score: f64,
    /// Sessions expire this long after creation.
    pub(crate) max_age_secs: u64,
    /// HTTP status codes that retire the session immediately.
    pub(crate) blocked_status_codes: Vec<u16>,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 1000,
            max_usage_count: 50,
            max_error_score: 3.0,
            max_age_secs: 3000,
            blocked_status_codes: vec![401, 403, 429],
        }
    }
}

/// Main configuration for a crawler run.
///
/// Concurrency bounds, retry policy, timeouts, session pool settings and
/// autoscaling thresholds. Every field has a usable default; the builder
/// validates cross-field constraints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    pub(crate) min_concurrency: usize,
    pub(crate) max_concurrency: usize,
    /// Starting concurrency; defaults to `min_concurrency`.
    pub(crate) desired_concurrency: Option<usize>,
    /// Rolling per-minute cap on task starts. `None` means unlimited.
    pub(crate) max_tasks_per_minute: Option<usize>,

    pub(crate) max_request_retries: u32,
    /// Dispatch cap: the crawler stops starting new requests at this count.
    pub(crate) max_requests_per_crawl: Option<usize>,

    /// Wall-clock budget for one user-handler invocation.
    pub(crate) request_handler_timeout_secs: u64,
    /// Budget for internal queue/session operations.
    ///
    /// Defaults to `max(2 × handler timeout, 300)` when unset.
    pub(crate) internal_timeout_secs: Option<u64>,
    /// How long a fetched request stays locked before other consumers may
    /// reclaim it.
    pub(crate) request_lock_secs: u64,

    pub(crate) use_session_pool: bool,
    pub(crate) session_pool: SessionPoolConfig,

    /// Keep running when the queue drains instead of finishing.
    pub(crate) keep_alive: bool,

    pub(crate) logging_interval_secs: u64,
    pub(crate) maybe_run_interval_millis: u64,
    pub(crate) scale_up_interval_millis: u64,
    pub(crate) scale_up_step_ratio: f64,
    pub(crate) scale_down_step_ratio: f64,

    /// Memory overload threshold as a fraction of total bytes.
    pub(crate) max_used_memory_ratio: f64,
    /// Event-loop drift beyond this many milliseconds marks a sample
    /// overloaded.
    pub(crate) max_blocked_millis: u64,
    /// Fraction of overloaded event-loop samples that flips the verdict.
    pub(crate) max_event_loop_overloaded_ratio: f64,
    /// Fraction of rate-limited responses that marks a sample overloaded.
    pub(crate) max_client_error_ratio: f64,

    pub(crate) persist_state_interval_secs: u64,
    /// Identifier baked into the statistics persistence key.
    pub(crate) statistics_id: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: None,
            max_tasks_per_minute: None,
            max_request_retries: 3,
            max_requests_per_crawl: None,
            request_handler_timeout_secs: 60,
            internal_timeout_secs: None,
            request_lock_secs: 60,
            use_session_pool: false,
            session_pool: SessionPoolConfig::default(),
            keep_alive: false,
            logging_interval_secs: 60,
            maybe_run_interval_millis: 500,
            scale_up_interval_millis: 5000,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            max_used_memory_ratio: 0.7,
            max_blocked_millis: 50,
            max_event_loop_overloaded_ratio: 0.6,
            max_client_error_ratio: 0.01,
            persist_state_interval_secs: 60,
            statistics_id: 0,
        }
    }
}
