//! Derived accessors for [`CrawlerConfig`]
//!
//! Plain field reads plus the handful of derived values (internal timeout,
//! durations) that more than one component needs to compute identically.

use std::time::Duration;

use super::types::{CrawlerConfig, SessionPoolConfig};

impl CrawlerConfig {
    #[must_use]
    pub fn min_concurrency(&self) -> usize {
        self.min_concurrency
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Starting concurrency; `min_concurrency` when unset.
    #[must_use]
    pub fn desired_concurrency(&self) -> usize {
        self.desired_concurrency.unwrap_or(self.min_concurrency)
    }

    #[must_use]
    pub fn max_tasks_per_minute(&self) -> Option<usize> {
        self.max_tasks_per_minute
    }

    #[must_use]
    pub fn max_request_retries(&self) -> u32 {
        self.max_request_retries
    }

    #[must_use]
    pub fn max_requests_per_crawl(&self) -> Option<usize> {
        self.max_requests_per_crawl
    }

    #[must_use]
    pub fn request_handler_timeout(&self) -> Duration {
        Duration::from_secs(self.request_handler_timeout_secs)
    }

    /// Budget for internal queue/session operations.
    ///
    /// `max(2 × handler timeout, 300 s)` unless explicitly configured.
    #[must_use]
    pub fn internal_timeout(&self) -> Duration {
        let secs = self
            .internal_timeout_secs
            .unwrap_or_else(|| (self.request_handler_timeout_secs * 2).max(300));
        Duration::from_secs(secs)
    }

    #[must_use]
    pub fn request_lock_secs(&self) -> u64 {
        self.request_lock_secs
    }

    #[must_use]
    pub fn use_session_pool(&self) -> bool {
        self.use_session_pool
    }

    #[must_use]
    pub fn session_pool(&self) -> &SessionPoolConfig {
        &self.session_pool
    }

    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[must_use]
    pub fn logging_interval(&self) -> Duration {
        Duration::from_secs(self.logging_interval_secs)
    }

    #[must_use]
    pub fn maybe_run_interval(&self) -> Duration {
        Duration::from_millis(self.maybe_run_interval_millis)
    }

    #[must_use]
    pub fn scale_up_interval(&self) -> Duration {
        Duration::from_millis(self.scale_up_interval_millis)
    }

    #[must_use]
    pub fn scale_up_step_ratio(&self) -> f64 {
        self.scale_up_step_ratio
    }

    #[must_use]
    pub fn scale_down_step_ratio(&self) -> f64 {
        self.scale_down_step_ratio
    }

    #[must_use]
    pub fn max_used_memory_ratio(&self) -> f64 {
        self.max_used_memory_ratio
    }

    #[must_use]
    pub fn max_blocked_millis(&self) -> u64 {
        self.max_blocked_millis
    }

    #[must_use]
    pub fn max_event_loop_overloaded_ratio(&self) -> f64 {
        self.max_event_loop_overloaded_ratio
    }

    #[must_use]
    pub fn max_client_error_ratio(&self) -> f64 {
        self.max_client_error_ratio
    }

    #[must_use]
    pub fn persist_state_interval(&self) -> Duration {
        Duration::from_secs(self.persist_state_interval_secs)
    }

    #[must_use]
    pub fn statistics_id(&self) -> u32 {
        self.statistics_id
    }
}

impl SessionPoolConfig {
    #[must_use]
    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    #[must_use]
    pub fn max_usage_count(&self) -> u32 {
        self.max_usage_count
    }

    #[must_use]
    pub fn max_error_score(&self) -> f64 {
        self.max_error_score
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    #[must_use]
    pub fn blocked_status_codes(&self) -> &[u16] {
        &self.blocked_status_codes
    }
}
