//! Builder for [`CrawlerConfig`]
//!
//! Setters mirror the configuration fields one-to-one; `build` validates
//! cross-field constraints and returns the finished config.

use anyhow::{Result, bail};

use super::types::{CrawlerConfig, SessionPoolConfig};

/// Fluent builder over [`CrawlerConfig`] defaults.
#[derive(Debug, Default)]
pub struct CrawlerConfigBuilder {
    config: CrawlerConfig,
}

impl CrawlerConfig {
    #[must_use]
    pub fn builder() -> CrawlerConfigBuilder {
        CrawlerConfigBuilder::default()
    }
}

impl CrawlerConfigBuilder {
    #[must_use]
    pub fn min_concurrency(mut self, value: usize) -> Self {
        self.config.min_concurrency = value;
        self
    }

    #[must_use]
    pub fn max_concurrency(mut self, value: usize) -> Self {
        self.config.max_concurrency = value;
        self
    }

    #[must_use]
    pub fn desired_concurrency(mut self, value: usize) -> Self {
        self.config.desired_concurrency = Some(value);
        self
    }

    #[must_use]
    pub fn max_tasks_per_minute(mut self, value: usize) -> Self {
        self.config.max_tasks_per_minute = Some(value);
        self
    }

    #[must_use]
    pub fn max_request_retries(mut self, value: u32) -> Self {
        self.config.max_request_retries = value;
        self
    }

    #[must_use]
    pub fn max_requests_per_crawl(mut self, value: usize) -> Self {
        self.config.max_requests_per_crawl = Some(value);
        self
    }

    #[must_use]
    pub fn request_handler_timeout_secs(mut self, value: u64) -> Self {
        self.config.request_handler_timeout_secs = value;
        self
    }

    #[must_use]
    pub fn internal_timeout_secs(mut self, value: u64) -> Self {
        self.config.internal_timeout_secs = Some(value);
        self
    }

    #[must_use]
    pub fn request_lock_secs(mut self, value: u64) -> Self {
        self.config.request_lock_secs = value;
        self
    }

    #[must_use]
    pub fn use_session_pool(mut self, value: bool) -> Self {
        self.config.use_session_pool = value;
        self
    }

    #[must_use]
    pub fn session_pool(mut self, value: SessionPoolConfig) -> Self {
        self.config.session_pool = value;
        self
    }

    #[must_use]
    pub fn session_max_pool_size(mut self, value: usize) -> Self {
        self.config.session_pool.max_pool_size = value;
        self
    }

    #[must_use]
    pub fn session_max_usage_count(mut self, value: u32) -> Self {
        self.config.session_pool.max_usage_count = value;
        self
    }

    #[must_use]
    pub fn session_max_error_score(mut self, value: f64) -> Self {
        self.config.session_pool.max_error_score = value;
        self
    }

    #[must_use]
    pub fn session_blocked_status_codes(mut self, value: Vec<u16>) -> Self {
        self.config.session_pool.blocked_status_codes = value;
        self
    }

    #[must_use]
    pub fn keep_alive(mut self, value: bool) -> Self {
        self.config.keep_alive = value;
        self
    }

    #[must_use]
    pub fn logging_interval_secs(mut self, value: u64) -> Self {
        self.config.logging_interval_secs = value;
        self
    }

    #[must_use]
    pub fn maybe_run_interval_millis(mut self, value: u64) -> Self {
        self.config.maybe_run_interval_millis = value;
        self
    }

    #[must_use]
    pub fn scale_up_interval_millis(mut self, value: u64) -> Self {
        self.config.scale_up_interval_millis = value;
        self
    }

    #[must_use]
    pub fn scale_up_step_ratio(mut self, value: f64) -> Self {
        self.config.scale_up_step_ratio = value;
        self
    }

    #[must_use]
    pub fn scale_down_step_ratio(mut self, value: f64) -> Self {
        self.config.scale_down_step_ratio = value;
        self
    }

    #[must_use]
    pub fn max_used_memory_ratio(mut self, value: f64) -> Self {
        self.config.max_used_memory_ratio = value;
        self
    }

    #[must_use]
    pub fn max_blocked_millis(mut self, value: u64) -> Self {
        self.config.max_blocked_millis = value;
        self
    }

    #[must_use]
    pub fn max_event_loop_overloaded_ratio(mut self, value: f64) -> Self {
        self.config.max_event_loop_overloaded_ratio = value;
        self
    }

    #[must_use]
    pub fn max_client_error_ratio(mut self, value: f64) -> Self {
        self.config.max_client_error_ratio = value;
        self
    }

    #[must_use]
    pub fn persist_state_interval_secs(mut self, value: u64) -> Self {
        self.config.persist_state_interval_secs = value;
        self
    }

    #[must_use]
    pub fn statistics_id(mut self, value: u32) -> Self {
        self.config.statistics_id = value;
        self
    }

    /// Validate cross-field constraints and return the config.
    pub fn build(self) -> Result<CrawlerConfig> {
        let config = self.config;

        if config.min_concurrency == 0 {
            bail!("min_concurrency must be at least 1");
        }
        if config.min_concurrency > config.max_concurrency {
            bail!(
                "min_concurrency ({}) must not exceed max_concurrency ({})",
                config.min_concurrency,
                config.max_concurrency
            );
        }
        if let Some(desired) = config.desired_concurrency
            && (desired < config.min_concurrency || desired > config.max_concurrency)
        {
            bail!(
                "desired_concurrency ({desired}) must lie within [{}, {}]",
                config.min_concurrency,
                config.max_concurrency
            );
        }
        if config.request_handler_timeout_secs == 0 {
            bail!("request_handler_timeout_secs must be positive");
        }
        if !(0.0..=1.0).contains(&config.max_used_memory_ratio) {
            bail!("max_used_memory_ratio must lie within [0, 1]");
        }
        if config.scale_up_step_ratio <= 0.0 || config.scale_down_step_ratio <= 0.0 {
            bail!("scale step ratios must be positive");
        }

        Ok(config)
    }
}
