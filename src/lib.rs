//! spiderling: a concurrent, autoscaled crawling engine core
//!
//! A worker pool pulls URL-bearing requests from a deduplicated queue,
//! runs each through a composable context pipeline into a user handler,
//! and manages retries, session rotation, statistics, state persistence
//! and graceful shutdown. Context enrichment (raw bodies, parsed HTML,
//! browser pages) is supplied by middlewares; the engine has no opinion
//! on transports or parsers beyond the thin `send_request` helper.
//!
//! ```no_run
//! use spiderling::{Crawler, CrawlerConfig, Request};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CrawlerConfig::builder().max_request_retries(2).build()?;
//! let crawler = Crawler::builder(config)
//!     .default_handler(|ctx| {
//!         Box::pin(async move {
//!             let response = ctx.send_request().await?;
//!             ctx.push_data(serde_json::json!({
//!                 "url": ctx.request.url,
//!                 "status": response.status().as_u16(),
//!             }))
//!             .await
//!         })
//!     })
//!     .build();
//!
//! let stats = crawler.run(vec![Request::new("https://example.com")]).await?;
//! println!("finished {} requests", stats.requests_finished);
//! # Ok(())
//! # }
//! ```

pub mod autoscaling;
pub mod config;
pub mod crawler;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod request;
pub mod request_list;
pub mod request_queue;
pub mod session;
pub mod stats;
pub mod storage;
pub mod utils;

pub use autoscaling::{
    AutoscaledPool, AutoscaledPoolOptions, Snapshotter, SnapshotterOptions, SystemStatus,
    SystemStatusOptions,
};
pub use config::{CrawlerConfig, CrawlerConfigBuilder, SessionPoolConfig};
pub use crawler::{
    Crawler, CrawlerBuilder, CrawlingContext, ProxyInfo, RequestHandler, Router,
    SAFE_MIGRATION_WAIT,
};
pub use errors::{
    CleanupError, CriticalError, HandlerError, InitializationError, InterruptedError,
    NonRetryableError, RetryRequestError, SessionError, TimeoutError,
};
pub use events::{EventBus, EventBusError, SystemEvent, SystemLoad};
pub use pipeline::{ContextPipeline, Extendable, Extensions, Middleware, extension};
pub use request::{Request, RequestState, unique_key_from_url};
pub use request_list::{RequestList, RequestListSource};
pub use request_queue::{RequestQueue, RequestQueueOptions};
pub use session::{Session, SessionPool};
pub use stats::{ErrorGroup, ErrorSnapshot, ErrorTracker, Statistics, StatisticsState};
pub use storage::{
    AddRequestResult, Dataset, KeyValueStore, MemoryDataset, MemoryKeyValueStore,
    MemoryQueueClient, RequestQueueClient,
};
