//! The autoscaled worker pool
//!
//! A single driver loop owns all scheduling decisions: it probes for ready
//! tasks on a short interval, dispatches up to the desired concurrency,
//! scales that desire up when the system is idle and down when it has been
//! overloaded recently, enforces a rolling per-minute start budget, and
//! resolves once the finished probe says so and in-flight work drains.
//! Tasks themselves run as independent tokio tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use super::SystemStatus;

/// Probe: is a task ready to run right now?
pub type IsTaskReadyFn = Arc<dyn Fn() -> BoxFuture<'static, Result<bool>> + Send + Sync>;
/// One unit of work. An `Err` return aborts the whole pool.
pub type RunTaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Probe: is the run complete (ignoring in-flight tasks)?
pub type IsFinishedFn = Arc<dyn Fn() -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Cadence of the completion probe.
const FINISHED_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Poll cadence while waiting for in-flight tasks to drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Tuning for an [`AutoscaledPool`].
#[derive(Clone)]
pub struct AutoscaledPoolOptions {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    /// Starting concurrency; clamped into `[min, max]`.
    pub desired_concurrency: usize,
    pub maybe_run_interval: Duration,
    pub scale_interval: Duration,
    pub logging_interval: Duration,
    pub scale_up_step_ratio: f64,
    pub scale_down_step_ratio: f64,
    /// Rolling cap on task starts per 60 s window. `None` = unlimited.
    pub max_tasks_per_minute: Option<usize>,
    /// Wall-clock bound for one task; a task past it is abandoned with an
    /// error log rather than aborting the crawl.
    pub task_timeout: Option<Duration>,
}

impl Default for AutoscaledPoolOptions {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency: 1,
            maybe_run_interval: Duration::from_millis(500),
            scale_interval: Duration::from_secs(5),
            logging_interval: Duration::from_secs(60),
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            max_tasks_per_minute: None,
            task_timeout: None,
        }
    }
}

/// Worker pool that adapts its concurrency to system load.
pub struct AutoscaledPool {
    options: AutoscaledPoolOptions,
    is_task_ready: IsTaskReadyFn,
    run_task: RunTaskFn,
    is_finished: IsFinishedFn,
    system_status: Option<Arc<SystemStatus>>,

    desired: AtomicUsize,
    running: AtomicUsize,
    paused: AtomicBool,
    aborted: AtomicBool,
    abort_notify: Notify,
    task_starts: Mutex<VecDeque<Instant>>,
}

impl AutoscaledPool {
    #[must_use]
    pub fn new(
        options: AutoscaledPoolOptions,
        is_task_ready: IsTaskReadyFn,
        run_task: RunTaskFn,
        is_finished: IsFinishedFn,
    ) -> Self {
        let desired = options
            .desired_concurrency
            .clamp(options.min_concurrency, options.max_concurrency);
        Self {
            options,
            is_task_ready,
            run_task,
            is_finished,
            system_status: None,
            desired: AtomicUsize::new(desired),
            running: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_notify: Notify::new(),
            task_starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Attach the system-status source driving scaling decisions.
    ///
    /// Without one the pool never scales and stays at its initial desired
    /// concurrency.
    #[must_use]
    pub fn with_system_status(mut self, status: Arc<SystemStatus>) -> Self {
        self.system_status = Some(status);
        self
    }

    #[must_use]
    pub fn desired_concurrency(&self) -> usize {
        self.desired.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn current_concurrency(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Stop dispatching new tasks and wait for in-flight ones to drain.
    ///
    /// Returns true when everything drained before `graceful_wait`, false
    /// when the deadline passed with tasks still in flight.
    pub async fn pause(&self, graceful_wait: Duration) -> bool {
        self.paused.store(true, Ordering::Release);
        let deadline = Instant::now() + graceful_wait;
        while self.running.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
        true
    }

    /// Resume dispatching after a [`pause`](Self::pause).
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Cancel all pending work and make [`run`](Self::run) return an error.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.abort_notify.notify_waiters();
    }

    /// Drive the pool until the finished probe resolves and in-flight work
    /// drains, or an abort / task error ends the run early.
    pub async fn run(&self) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let mut maybe_run = tokio::time::interval(self.options.maybe_run_interval);
        let mut scale_up = tokio::time::interval(self.options.scale_interval);
        let mut scale_down = tokio::time::interval(self.options.scale_interval);
        let mut logging = tokio::time::interval(self.options.logging_interval);
        let mut finished_check = tokio::time::interval(FINISHED_CHECK_INTERVAL);
        for interval in [
            &mut maybe_run,
            &mut scale_up,
            &mut scale_down,
            &mut logging,
            &mut finished_check,
        ] {
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        info!(
            "autoscaled pool starting (concurrency {}..{}, desired {})",
            self.options.min_concurrency,
            self.options.max_concurrency,
            self.desired_concurrency()
        );

        let result = loop {
            tokio::select! {
                _ = maybe_run.tick() => {
                    if let Err(err) = self.dispatch(&mut tasks).await {
                        break Err(err);
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.running.fetch_sub(1, Ordering::AcqRel);
                    match joined {
                        Ok(Ok(())) => {
                            // Probe again right away instead of waiting for
                            // the next tick; keeps the pool saturated.
                            if let Err(err) = self.dispatch(&mut tasks).await {
                                break Err(err);
                            }
                            // When nothing new started, this may have been
                            // the last task; resolve promptly instead of
                            // waiting for the next completion-check tick.
                            if tasks.is_empty() && !self.paused.load(Ordering::Acquire) {
                                match (self.is_finished)().await {
                                    Ok(true) => break Ok(()),
                                    Ok(false) => {}
                                    Err(err) => break Err(err),
                                }
                            }
                        }
                        Ok(Err(err)) => break Err(err),
                        Err(join_err) if join_err.is_cancelled() => {}
                        Err(join_err) => {
                            break Err(anyhow::anyhow!("pool task panicked: {join_err}"));
                        }
                    }
                }
                _ = scale_up.tick() => self.maybe_scale_up(),
                _ = scale_down.tick() => self.maybe_scale_down(),
                _ = logging.tick() => self.log_status(),
                _ = finished_check.tick() => {
                    if self.running.load(Ordering::Acquire) == 0
                        && tasks.is_empty()
                        && !self.paused.load(Ordering::Acquire)
                    {
                        match (self.is_finished)().await {
                            Ok(true) => break Ok(()),
                            Ok(false) => {}
                            Err(err) => break Err(err),
                        }
                    }
                }
                _ = self.abort_notify.notified() => {
                    break Err(anyhow::anyhow!("autoscaled pool aborted"));
                }
            }

            if self.aborted.load(Ordering::Acquire) {
                break Err(anyhow::anyhow!("autoscaled pool aborted"));
            }
        };

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        match &result {
            Ok(()) => info!("autoscaled pool finished"),
            Err(err) => warn!("autoscaled pool stopped: {err}"),
        }
        result
    }

    /// Start tasks while capacity, readiness and budget allow.
    async fn dispatch(&self, tasks: &mut JoinSet<Result<()>>) -> Result<()> {
        if self.paused.load(Ordering::Acquire) || self.aborted.load(Ordering::Acquire) {
            return Ok(());
        }

        while self.running.load(Ordering::Acquire) < self.desired.load(Ordering::Acquire) {
            if !self.has_minute_budget() {
                debug!("per-minute task budget exhausted, backing off");
                break;
            }
            if !(self.is_task_ready)().await? {
                break;
            }

            self.note_task_start();
            self.running.fetch_add(1, Ordering::AcqRel);

            let fut = (self.run_task)();
            let task_timeout = self.options.task_timeout;
            tasks.spawn(async move {
                match task_timeout {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(result) => result,
                        Err(_) => {
                            // The task owns its internal deadlines; blowing
                            // the outer wall clock means it hung somewhere
                            // uncancellable. Abandon it, keep the crawl.
                            warn!("task exceeded its {limit:?} wall clock, abandoning");
                            Ok(())
                        }
                    },
                    None => fut.await,
                }
            });
        }
        Ok(())
    }

    fn has_minute_budget(&self) -> bool {
        let Some(limit) = self.options.max_tasks_per_minute else {
            return true;
        };
        let mut starts = self.task_starts.lock();
        let cutoff = Instant::now() - Duration::from_secs(60);
        while starts.front().is_some_and(|t| *t < cutoff) {
            starts.pop_front();
        }
        starts.len() < limit
    }

    fn note_task_start(&self) {
        if self.options.max_tasks_per_minute.is_some() {
            self.task_starts.lock().push_back(Instant::now());
        }
    }

    fn maybe_scale_up(&self) {
        let idle = self
            .system_status
            .as_ref()
            .is_some_and(|s| s.current_status().is_system_idle);
        if !idle {
            return;
        }

        let desired = self.desired.load(Ordering::Acquire);
        let running = self.running.load(Ordering::Acquire);
        if desired >= self.options.max_concurrency {
            return;
        }
        // Only grow when the current allowance is actually being used.
        if (running as f64) < 0.9 * desired as f64 {
            return;
        }
        if !self.has_minute_budget() {
            return;
        }

        let step = ((self.options.scale_up_step_ratio * desired as f64).ceil() as usize).max(1);
        let new = (desired + step).min(self.options.max_concurrency);
        self.desired.store(new, Ordering::Release);
        debug!("scaled up desired concurrency {desired} -> {new}");
    }

    fn maybe_scale_down(&self) {
        let overloaded = self
            .system_status
            .as_ref()
            .is_some_and(|s| s.has_been_overloaded_recently());
        if !overloaded {
            return;
        }

        let desired = self.desired.load(Ordering::Acquire);
        if desired <= self.options.min_concurrency {
            return;
        }
        let step = ((self.options.scale_down_step_ratio * desired as f64).ceil() as usize).max(1);
        let new = desired
            .saturating_sub(step)
            .max(self.options.min_concurrency);
        self.desired.store(new, Ordering::Release);
        debug!("scaled down desired concurrency {desired} -> {new}");
    }

    fn log_status(&self) {
        let idle = self
            .system_status
            .as_ref()
            .map(|s| s.current_status().is_system_idle);
        info!(
            "pool status: running {}, desired {}, system idle: {}",
            self.current_concurrency(),
            self.desired_concurrency(),
            idle.map_or_else(|| "n/a".to_string(), |i| i.to_string()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_pool(
        total: usize,
        options: AutoscaledPoolOptions,
    ) -> (Arc<AtomicUsize>, AutoscaledPool) {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        let ready_started = Arc::clone(&started);
        let is_task_ready: IsTaskReadyFn = Arc::new(move || {
            let started = Arc::clone(&ready_started);
            Box::pin(async move { Ok(started.load(Ordering::SeqCst) < total) })
        });

        let run_started = Arc::clone(&started);
        let run_finished = Arc::clone(&finished);
        let run_task: RunTaskFn = Arc::new(move || {
            run_started.fetch_add(1, Ordering::SeqCst);
            let finished = Arc::clone(&run_finished);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let done_finished = Arc::clone(&finished);
        let is_finished: IsFinishedFn = Arc::new(move || {
            let finished = Arc::clone(&done_finished);
            Box::pin(async move { Ok(finished.load(Ordering::SeqCst) >= total) })
        });

        (started, AutoscaledPool::new(options, is_task_ready, run_task, is_finished))
    }

    fn fast_options() -> AutoscaledPoolOptions {
        AutoscaledPoolOptions {
            maybe_run_interval: Duration::from_millis(10),
            scale_interval: Duration::from_millis(50),
            logging_interval: Duration::from_secs(3600),
            ..AutoscaledPoolOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_all_tasks_and_finishes() {
        let (started, pool) = counting_pool(10, fast_options());
        pool.run().await.expect("pool should finish cleanly");
        assert_eq!(started.load(Ordering::SeqCst), 10);
        assert_eq!(pool.current_concurrency(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_error_aborts_the_run() {
        let is_task_ready: IsTaskReadyFn = Arc::new(|| Box::pin(async { Ok(true) }));
        let run_task: RunTaskFn =
            Arc::new(|| Box::pin(async { Err(anyhow::anyhow!("task exploded")) }));
        let is_finished: IsFinishedFn = Arc::new(|| Box::pin(async { Ok(false) }));

        let pool = AutoscaledPool::new(fast_options(), is_task_ready, run_task, is_finished);
        let err = pool.run().await.expect_err("error should surface");
        assert!(err.to_string().contains("task exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_the_run() {
        let is_task_ready: IsTaskReadyFn = Arc::new(|| Box::pin(async { Ok(false) }));
        let run_task: RunTaskFn = Arc::new(|| Box::pin(async { Ok(()) }));
        let is_finished: IsFinishedFn = Arc::new(|| Box::pin(async { Ok(false) }));

        let pool = Arc::new(AutoscaledPool::new(
            fast_options(),
            is_task_ready,
            run_task,
            is_finished,
        ));
        let runner = Arc::clone(&pool);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.abort();

        let result = handle.await.expect("join");
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn minute_budget_caps_task_starts() {
        let options = AutoscaledPoolOptions {
            max_tasks_per_minute: Some(3),
            desired_concurrency: 10,
            max_concurrency: 10,
            ..fast_options()
        };
        let (started, pool) = counting_pool(100, options);
        let pool = Arc::new(pool);
        let runner = Arc::clone(&pool);
        let handle = tokio::spawn(async move { runner.run().await });

        // Well under a minute in: exactly the budget has started.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(started.load(Ordering::SeqCst), 3);

        // After the window rolls over, more starts are allowed.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(started.load(Ordering::SeqCst) > 3);

        pool.abort();
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn desired_concurrency_stays_within_bounds() {
        let options = AutoscaledPoolOptions {
            min_concurrency: 2,
            max_concurrency: 4,
            desired_concurrency: 100,
            ..fast_options()
        };
        let (_, pool) = counting_pool(1, options);
        assert_eq!(pool.desired_concurrency(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_waits_for_drain() {
        let options = AutoscaledPoolOptions {
            desired_concurrency: 2,
            max_concurrency: 4,
            ..fast_options()
        };
        let (_, pool) = counting_pool(4, options);
        let pool = Arc::new(pool);
        let runner = Arc::clone(&pool);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let drained = pool.pause(Duration::from_secs(5)).await;
        assert!(drained);
        assert_eq!(pool.current_concurrency(), 0);

        pool.abort();
        let _ = handle.await;
    }
}
