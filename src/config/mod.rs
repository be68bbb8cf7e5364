//! Crawler configuration
//!
//! The enumerated configuration surface of the engine: concurrency bounds,
//! retry policy, timeouts, session pool settings, autoscaling thresholds
//! and persistence cadence.

pub mod builder;
pub mod getters;
pub mod types;

pub use builder::CrawlerConfigBuilder;
pub use types::{CrawlerConfig, SessionPoolConfig};
