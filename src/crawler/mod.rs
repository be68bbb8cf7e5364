//! The crawler: binds queue, sessions, statistics, autoscaling and the
//! context pipeline into one run loop
//!
//! Each pool task fetches one request, builds a crawling context, runs it
//! through the middleware pipeline into the routed user handler, then
//! records the outcome: handled on success, reclaimed for retry or failed
//! terminally. Persistence is event-driven; a `Migrating` signal quiesces
//! the pool and forces a persist before the process goes away.

pub mod context;
pub mod router;

pub use context::{CrawlerHandle, CrawlingContext, ProxyInfo};
pub use router::{RequestHandler, Router};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::autoscaling::{
    AutoscaledPool, AutoscaledPoolOptions, IsFinishedFn, IsTaskReadyFn, RunTaskFn, Snapshotter,
    SnapshotterOptions, SystemStatus, SystemStatusOptions,
};
use crate::config::CrawlerConfig;
use crate::errors::{is_critical, is_non_retryable, is_retry_request, is_session_error};
use crate::events::{EventBus, SystemEvent};
use crate::pipeline::ContextPipeline;
use crate::request::{Request, RequestState};
use crate::request_list::RequestList;
use crate::request_queue::{RequestQueue, RequestQueueOptions};
use crate::session::{SessionFactory, SessionPool};
use crate::stats::{Statistics, StatisticsState};
use crate::storage::{
    Dataset, KeyValueStore, MemoryDataset, MemoryKeyValueStore, MemoryQueueClient,
    RequestQueueClient,
};
use crate::utils::with_timeout;

/// How long in-flight tasks get to finish when a migration is signalled.
pub const SAFE_MIGRATION_WAIT: Duration = Duration::from_millis(20_000);

/// Extra wall-clock slack a task gets beyond its handler and internal
/// timeouts before the pool abandons it.
const TASK_TIMEOUT_BUFFER: Duration = Duration::from_secs(10);

/// Handler invoked on retryable or final errors, with the triggering error.
pub type ErrorHandlerFn = Arc<
    dyn for<'a> Fn(&'a mut CrawlingContext, &'a anyhow::Error) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

struct CrawlerInner {
    config: CrawlerConfig,
    queue: Arc<RequestQueue>,
    list: Option<Arc<RequestList>>,
    session_pool: Option<Arc<SessionPool>>,
    stats: Arc<Statistics>,
    events: Arc<EventBus>,
    snapshotter: Arc<Snapshotter>,
    system_status: Arc<SystemStatus>,
    router: Router,
    pipeline: ContextPipeline<CrawlingContext>,
    error_handler: Option<ErrorHandlerFn>,
    failed_request_handler: Option<ErrorHandlerFn>,
    handle: Arc<CrawlerHandle>,
    /// Contexts currently executing, by context id.
    active: dashmap::DashMap<String, String>,
    /// Requests dispatched so far; the `max_requests_per_crawl` cap counts
    /// dispatches, not enqueues.
    dispatched: AtomicUsize,
    migrating: AtomicBool,
    handle_sigint: bool,
}

impl CrawlerInner {
    fn dispatch_limit_reached(&self) -> bool {
        self.config
            .max_requests_per_crawl()
            .is_some_and(|limit| self.dispatched.load(Ordering::SeqCst) >= limit)
    }
}

/// Removes a context from the active map on every exit path.
struct ActiveGuard<'a> {
    active: &'a dashmap::DashMap<String, String>,
    id: String,
}

impl<'a> ActiveGuard<'a> {
    fn register(active: &'a dashmap::DashMap<String, String>, ctx: &CrawlingContext) -> Self {
        active.insert(ctx.id.clone(), ctx.request.url.clone());
        Self {
            active,
            id: ctx.id.clone(),
        }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

/// Builder wiring storage, handlers, middlewares and options into a
/// [`Crawler`].
pub struct CrawlerBuilder {
    config: CrawlerConfig,
    kv: Arc<dyn KeyValueStore>,
    dataset: Arc<dyn Dataset>,
    events: Arc<EventBus>,
    queue: Option<Arc<RequestQueue>>,
    queue_client: Option<Arc<dyn RequestQueueClient>>,
    list: Option<RequestList>,
    router: Router,
    pipeline: ContextPipeline<CrawlingContext>,
    error_handler: Option<ErrorHandlerFn>,
    failed_request_handler: Option<ErrorHandlerFn>,
    session_factory: Option<SessionFactory>,
    handle_sigint: bool,
}

impl CrawlerBuilder {
    #[must_use]
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            config,
            kv: MemoryKeyValueStore::shared(),
            dataset: MemoryDataset::shared(),
            events: EventBus::shared(1024),
            queue: None,
            queue_client: None,
            list: None,
            router: Router::new(),
            pipeline: ContextPipeline::new(),
            error_handler: None,
            failed_request_handler: None,
            session_factory: None,
            handle_sigint: false,
        }
    }

    #[must_use]
    pub fn kv_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = kv;
        self
    }

    #[must_use]
    pub fn dataset(mut self, dataset: Arc<dyn Dataset>) -> Self {
        self.dataset = dataset;
        self
    }

    #[must_use]
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Use a fully-configured queue instead of the default in-memory one.
    #[must_use]
    pub fn request_queue(mut self, queue: Arc<RequestQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use a custom queue backend with engine-managed options.
    #[must_use]
    pub fn queue_client(mut self, client: Arc<dyn RequestQueueClient>) -> Self {
        self.queue_client = Some(client);
        self
    }

    /// Feed initial work from a request list; it drains into the queue so
    /// each item is crawled once even across restarts.
    #[must_use]
    pub fn request_list(mut self, list: RequestList) -> Self {
        self.list = Some(list);
        self
    }

    /// Register a handler for one label.
    #[must_use]
    pub fn handler<F>(mut self, label: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut CrawlingContext) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.router.add_handler(label, handler);
        self
    }

    /// Register the handler for unlabeled or unmatched requests.
    #[must_use]
    pub fn default_handler<F>(mut self, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut CrawlingContext) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.router.set_default_handler(handler);
        self
    }

    /// Append a context-enrichment middleware.
    #[must_use]
    pub fn middleware(mut self, middleware: crate::pipeline::Middleware<CrawlingContext>) -> Self {
        self.pipeline = self.pipeline.compose(middleware);
        self
    }

    /// Invoked before each retry with the triggering error.
    #[must_use]
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut CrawlingContext, &'a anyhow::Error) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Invoked once per request after its final failure.
    #[must_use]
    pub fn failed_request_handler<F>(mut self, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut CrawlingContext, &'a anyhow::Error) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.failed_request_handler = Some(Arc::new(handler));
        self
    }

    /// Custom session constructor for the session pool.
    #[must_use]
    pub fn session_factory(mut self, factory: SessionFactory) -> Self {
        self.session_factory = Some(factory);
        self
    }

    /// Install a Ctrl-C handler: first signal pauses, second aborts.
    #[must_use]
    pub fn handle_sigint(mut self, enabled: bool) -> Self {
        self.handle_sigint = enabled;
        self
    }

    #[must_use]
    pub fn build(self) -> Crawler {
        let config = self.config;

        let queue_options = RequestQueueOptions {
            lock_secs: config.request_lock_secs(),
            op_timeout: config.internal_timeout(),
        };
        let queue = match (self.queue, self.queue_client) {
            (Some(queue), _) => queue,
            (None, Some(client)) => Arc::new(RequestQueue::new(client, queue_options)),
            (None, None) => Arc::new(RequestQueue::new(MemoryQueueClient::shared(), queue_options)),
        };

        let stats = Arc::new(
            Statistics::new(config.statistics_id()).with_kv_store(Arc::clone(&self.kv)),
        );

        let session_pool = config.use_session_pool().then(|| {
            let mut pool =
                SessionPool::new(config.session_pool().clone()).with_kv_store(Arc::clone(&self.kv));
            if let Some(factory) = self.session_factory {
                pool = pool.with_factory(factory);
            }
            Arc::new(pool)
        });

        let snapshotter = Snapshotter::shared(SnapshotterOptions {
            max_used_memory_ratio: config.max_used_memory_ratio(),
            max_blocked_millis: config.max_blocked_millis(),
            max_client_error_ratio: config.max_client_error_ratio(),
            ..SnapshotterOptions::default()
        });
        let system_status = Arc::new(SystemStatus::new(
            Arc::clone(&snapshotter),
            SystemStatusOptions {
                max_event_loop_overloaded_ratio: config.max_event_loop_overloaded_ratio(),
                ..SystemStatusOptions::default()
            },
        ));

        let handle = Arc::new(CrawlerHandle {
            kv: Arc::clone(&self.kv),
            dataset: Arc::clone(&self.dataset),
            queue: Arc::clone(&queue),
            http: reqwest::Client::new(),
            stats: Arc::clone(&stats),
            snapshotter: Some(Arc::clone(&snapshotter)),
        });

        Crawler {
            inner: Arc::new(CrawlerInner {
                config,
                queue,
                list: self.list.map(Arc::new),
                session_pool,
                stats,
                events: self.events,
                snapshotter,
                system_status,
                router: self.router,
                pipeline: self.pipeline,
                error_handler: self.error_handler,
                failed_request_handler: self.failed_request_handler,
                handle,
                active: dashmap::DashMap::new(),
                dispatched: AtomicUsize::new(0),
                migrating: AtomicBool::new(false),
                handle_sigint: self.handle_sigint,
            }),
        }
    }
}

/// The crawling engine: drives requests from the queue through the
/// pipeline and user handlers under autoscaled concurrency.
pub struct Crawler {
    inner: Arc<CrawlerInner>,
}

impl Crawler {
    #[must_use]
    pub fn builder(config: CrawlerConfig) -> CrawlerBuilder {
        CrawlerBuilder::new(config)
    }

    #[must_use]
    pub fn stats(&self) -> Arc<Statistics> {
        Arc::clone(&self.inner.stats)
    }

    #[must_use]
    pub fn request_queue(&self) -> Arc<RequestQueue> {
        Arc::clone(&self.inner.queue)
    }

    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.events)
    }

    #[must_use]
    pub fn session_pool(&self) -> Option<Arc<SessionPool>> {
        self.inner.session_pool.as_ref().map(Arc::clone)
    }

    /// Crawl `initial` requests (plus whatever handlers enqueue) to
    /// completion and return the final statistics.
    pub async fn run(&self, initial: Vec<Request>) -> Result<StatisticsState> {
        let inner = &self.inner;

        inner.stats.initialize().await?;
        if let Some(pool) = &inner.session_pool {
            pool.initialize().await?;
        }
        if let Some(list) = &inner.list {
            list.initialize().await?;
        }
        if !initial.is_empty() {
            inner.queue.batch_add_requests(initial, false).await?;
        }

        // Event-driven persistence: every component reacts to PersistState.
        let mut background: Vec<JoinHandle<()>> = Vec::new();
        background.push(Arc::clone(&inner.stats).listen(&inner.events));
        if let Some(pool) = &inner.session_pool {
            background.push(Arc::clone(pool).listen(&inner.events));
        }
        if let Some(list) = &inner.list {
            background.push(spawn_list_persistence(Arc::clone(list), &inner.events));
        }
        background.push(
            Arc::clone(&inner.events)
                .start_persist_interval(inner.config.persist_state_interval()),
        );
        background.extend(Arc::clone(&inner.snapshotter).start(&inner.events));

        let pool = Arc::new(self.build_pool());
        background.push(spawn_event_listener(
            Arc::clone(inner),
            Arc::clone(&pool),
        ));
        if inner.handle_sigint {
            background.push(spawn_sigint_listener(Arc::clone(&pool)));
        }

        let run_result = pool.run().await;

        // Teardown runs on every exit path: stop sampling, release queue
        // locks, persist everything once more, close the bus.
        inner.snapshotter.stop_sampling();
        inner.queue.flush_head_cache().await;
        inner.stats.finalize();
        if let Err(err) = inner.stats.persist_state().await {
            warn!("final statistics persist failed: {err}");
        }
        if let Some(pool) = &inner.session_pool
            && let Err(err) = pool.persist_state().await
        {
            warn!("final session pool persist failed: {err}");
        }
        if let Some(list) = &inner.list
            && let Err(err) = list.persist_state().await
        {
            warn!("final request list persist failed: {err}");
        }
        inner.events.close();
        for handle in background {
            handle.abort();
        }

        let state = inner.stats.state();
        match run_result {
            Ok(()) => {}
            Err(_) if inner.migrating.load(Ordering::Acquire) => {
                info!("crawl quiesced for migration");
            }
            Err(err) => return Err(err),
        }

        info!(
            "crawl finished: {} succeeded, {} failed, {} retries in {}ms",
            state.requests_finished,
            state.requests_failed,
            state.requests_retries,
            state.crawler_runtime_millis
        );
        for group in inner.stats.most_popular_errors(3) {
            info!("  {}x {}: {}", group.count, group.name, group.message);
        }
        Ok(state)
    }

    fn build_pool(&self) -> AutoscaledPool {
        let inner = &self.inner;
        let config = &inner.config;

        let task_timeout =
            config.request_handler_timeout() + config.internal_timeout() + TASK_TIMEOUT_BUFFER;
        let options = AutoscaledPoolOptions {
            min_concurrency: config.min_concurrency(),
            max_concurrency: config.max_concurrency(),
            desired_concurrency: config.desired_concurrency(),
            maybe_run_interval: config.maybe_run_interval(),
            scale_interval: config.scale_up_interval(),
            logging_interval: config.logging_interval(),
            scale_up_step_ratio: config.scale_up_step_ratio(),
            scale_down_step_ratio: config.scale_down_step_ratio(),
            max_tasks_per_minute: config.max_tasks_per_minute(),
            task_timeout: Some(task_timeout),
        };

        let ready_inner = Arc::clone(inner);
        let is_task_ready: IsTaskReadyFn = Arc::new(move || {
            let inner = Arc::clone(&ready_inner);
            Box::pin(async move {
                if inner.dispatch_limit_reached() || inner.migrating.load(Ordering::Acquire) {
                    return Ok(false);
                }
                let has_work = match &inner.list {
                    Some(list) if !list.is_empty() => true,
                    _ => !inner.queue.is_empty().await?,
                };
                if has_work {
                    // Reserve the dispatch slot here so the cap is exact
                    // even with many tasks spawning concurrently; the task
                    // releases it if the fetch comes up empty.
                    inner.dispatched.fetch_add(1, Ordering::SeqCst);
                }
                Ok(has_work)
            })
        });

        let run_inner = Arc::clone(inner);
        let run_task: RunTaskFn = Arc::new(move || {
            let inner = Arc::clone(&run_inner);
            Box::pin(run_one_task(inner))
        });

        let finished_inner = Arc::clone(inner);
        let is_finished: IsFinishedFn = Arc::new(move || {
            let inner = Arc::clone(&finished_inner);
            Box::pin(async move {
                if inner.config.keep_alive() {
                    return Ok(false);
                }
                if inner.dispatch_limit_reached() {
                    return Ok(true);
                }
                if let Some(list) = &inner.list
                    && !list.is_finished()
                {
                    return Ok(false);
                }
                inner.queue.is_finished().await
            })
        });

        AutoscaledPool::new(options, is_task_ready, run_task, is_finished)
            .with_system_status(Arc::clone(&inner.system_status))
    }
}

/// One pool task: fetch, enrich, handle, record.
async fn run_one_task(inner: Arc<CrawlerInner>) -> Result<()> {
    let Some(request) = fetch_next(&inner).await? else {
        // The readiness probe reserved a dispatch slot; nothing came of it.
        inner.dispatched.fetch_sub(1, Ordering::SeqCst);
        return Ok(());
    };

    let session = inner.session_pool.as_ref().map(|pool| pool.get_session());
    let mut ctx = CrawlingContext::new(request, session, Arc::clone(&inner.handle));
    let _active = ActiveGuard::register(&inner.active, &ctx);

    let job_id = ctx
        .request
        .id
        .clone()
        .unwrap_or_else(|| ctx.request.unique_key.clone());
    inner.stats.start_job(&job_id, ctx.request.retry_count);
    ctx.request.state = RequestState::RequestHandler;

    let handler_timeout = inner.config.request_handler_timeout();
    let consumer_inner = Arc::clone(&inner);
    let outcome = inner
        .pipeline
        .run(&mut ctx, move |ctx| {
            let inner = consumer_inner;
            Box::pin(async move {
                with_timeout(
                    inner.router.dispatch(ctx),
                    handler_timeout,
                    "request handler",
                )
                .await
            })
        })
        .await;

    match outcome {
        Ok(()) => {
            ctx.request.state = RequestState::Done;
            inner.queue.mark_request_handled(ctx.request.clone()).await?;
            inner.stats.finish_job(&job_id);
            if let Some(session) = &ctx.session {
                session.mark_good();
            }
            debug!("handled {}", ctx.request.url);
            Ok(())
        }
        Err(err) => handle_failure(&inner, &mut ctx, &job_id, err).await,
    }
}

/// Serve the next request, draining one request-list item into the queue
/// first so list-fed work flows through queue locking and retry machinery.
async fn fetch_next(inner: &Arc<CrawlerInner>) -> Result<Option<Request>> {
    if let Some(list) = &inner.list
        && let Some(item) = list.fetch_next_request()
    {
        match inner.queue.add_request(item.clone(), true).await {
            Ok(_) => list.mark_request_handled(&item),
            Err(err) => {
                // The queue never saw it; give it back to the list.
                list.reclaim_request(&item);
                return Err(err);
            }
        }
    }
    inner.queue.fetch_next_request().await
}

/// The failure ladder of a dispatched request.
async fn handle_failure(
    inner: &Arc<CrawlerInner>,
    ctx: &mut CrawlingContext,
    job_id: &str,
    err: anyhow::Error,
) -> Result<()> {
    if is_critical(&err) {
        inner.stats.fail_job(job_id);
        error!(
            "critical error while processing {} {}: {err:#}",
            ctx.request.method, ctx.request.url
        );
        return Err(err);
    }

    if is_session_error(&err)
        && let Some(session) = &ctx.session
    {
        debug!("retiring session {} after session error", session.id());
        session.retire();
    }

    // RetryRequest waives only the retry-count term; no_retry always wins.
    let budget_left = ctx.request.retry_count < inner.config.max_request_retries();
    let should_retry = !ctx.request.no_retry
        && (is_retry_request(&err) || (budget_left && !is_non_retryable(&err)));

    if should_retry {
        inner.stats.add_retry_error(&err);
        inner.stats.track_retry();
        ctx.request.state = RequestState::ErrorHandler;

        if let Some(handler) = &inner.error_handler
            && let Err(secondary) = handler(ctx, &err).await
        {
            error!("error handler itself failed: {secondary:#}");
            return Err(secondary);
        }

        ctx.request.retry_count += 1;
        ctx.request.push_error_message(format!("{err:#}"));
        warn!(
            "retrying {} {} (attempt {} of {}): {err:#}",
            ctx.request.method,
            ctx.request.url,
            ctx.request.retry_count,
            inner.config.max_request_retries()
        );
        inner.queue.reclaim_request(ctx.request.clone(), false).await?;
        return Ok(());
    }

    inner.stats.add_final_error(&err);
    ctx.request.state = RequestState::Error;
    ctx.request.push_error_message(format!("{err:#}"));
    inner.queue.mark_request_handled(ctx.request.clone()).await?;

    if let Some(handler) = &inner.failed_request_handler
        && let Err(secondary) = handler(ctx, &err).await
    {
        error!("failed-request handler itself failed: {secondary:#}");
        return Err(secondary);
    }

    inner.stats.fail_job(job_id);
    if let Some(session) = &ctx.session {
        session.mark_bad();
    }
    error!(
        "request {} {} ({}) failed after {} retries: {err:#}",
        ctx.request.method,
        ctx.request.url,
        ctx.request.id.as_deref().unwrap_or("-"),
        ctx.request.retry_count
    );
    Ok(())
}

/// Persist a request list on every persist-worthy event.
fn spawn_list_persistence(list: Arc<RequestList>, bus: &Arc<EventBus>) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            if matches!(
                event,
                SystemEvent::PersistState { .. } | SystemEvent::Migrating
            ) && let Err(err) = list.persist_state().await
            {
                warn!("request list persistence failed: {err}");
            }
        }
    })
}

/// React to migration and abort signals from the event bus.
fn spawn_event_listener(inner: Arc<CrawlerInner>, pool: Arc<AutoscaledPool>) -> JoinHandle<()> {
    let mut receiver = inner.events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(SystemEvent::Migrating) => {
                    info!("migration signalled, quiescing crawl");
                    inner.migrating.store(true, Ordering::Release);
                    if !pool.pause(SAFE_MIGRATION_WAIT).await {
                        warn!(
                            "in-flight tasks exceeded the migration wait of {SAFE_MIGRATION_WAIT:?}"
                        );
                    }
                    let _ = inner
                        .events
                        .publish(SystemEvent::PersistState { is_migrating: true });
                    // Give the persistence listeners one scheduling round
                    // before the pool run ends.
                    tokio::task::yield_now().await;
                    pool.abort();
                }
                Ok(SystemEvent::Aborting) => {
                    info!("abort signalled");
                    pool.abort();
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(_) => {}
            }
        }
    })
}

/// First Ctrl-C pauses the pool; a second aborts it.
fn spawn_sigint_listener(pool: Arc<AutoscaledPool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("interrupt received: pausing crawl, interrupt again to abort");
        let drain_pool = Arc::clone(&pool);
        let drain = tokio::spawn(async move {
            if drain_pool.pause(Duration::from_secs(30)).await {
                info!("crawl drained after interrupt");
            }
        });
        if tokio::signal::ctrl_c().await.is_ok() {
            pool.abort();
        }
        drain.abort();
    })
}
