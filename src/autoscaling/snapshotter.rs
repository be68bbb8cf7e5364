//! Rolling system-load snapshots
//!
//! The snapshotter samples four resources at fixed intervals: memory use
//! (against a configured fraction of total bytes), event-loop lag (timer
//! drift against a blocked-time threshold), CPU (`SystemInfo` events on
//! the bus plus a local load-average probe normalized by core count), and
//! client error rate (rate-limited responses per sample window). Each
//! sample is just `{created_at, is_overloaded}`; verdicts over windows
//! are [`SystemStatus`](super::SystemStatus)'s job.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::events::{EventBus, SystemEvent};

/// One load reading for one resource.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub created_at: Instant,
    pub is_overloaded: bool,
}

/// Which resource a sample series describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Memory,
    EventLoop,
    Cpu,
    Client,
}

/// Tuning for the snapshotter.
#[derive(Debug, Clone)]
pub struct SnapshotterOptions {
    /// Cadence of memory and client-error sampling.
    pub snapshot_interval: Duration,
    /// Cadence (and expected sleep) of the event-loop drift probe.
    pub event_loop_interval: Duration,
    /// Samples older than this are pruned.
    pub history: Duration,
    /// Memory overload threshold as a fraction of total bytes.
    pub max_used_memory_ratio: f64,
    /// Timer drift beyond this marks an event-loop sample overloaded.
    pub max_blocked_millis: u64,
    /// Fraction of rate-limited responses that marks a client sample
    /// overloaded.
    pub max_client_error_ratio: f64,
    /// One-minute load average per core beyond which a local CPU sample
    /// counts as overloaded.
    pub max_cpu_load_ratio: f64,
}

impl Default for SnapshotterOptions {
    fn default() -> Self {
        Self {
            snapshot_interval: Duration::from_secs(1),
            event_loop_interval: Duration::from_millis(500),
            history: Duration::from_secs(30),
            max_used_memory_ratio: 0.7,
            max_blocked_millis: 50,
            max_client_error_ratio: 0.01,
            max_cpu_load_ratio: 0.95,
        }
    }
}

/// Collects bounded rolling sample windows for each resource.
pub struct Snapshotter {
    options: SnapshotterOptions,
    memory: Mutex<VecDeque<Sample>>,
    event_loop: Mutex<VecDeque<Sample>>,
    cpu: Mutex<VecDeque<Sample>>,
    client: Mutex<VecDeque<Sample>>,
    /// Rate-limited (429) responses observed since start.
    client_errors: AtomicU64,
    /// All responses observed since start.
    client_requests: AtomicU64,
    stop: Notify,
}

impl Snapshotter {
    #[must_use]
    pub fn new(options: SnapshotterOptions) -> Self {
        Self {
            options,
            memory: Mutex::new(VecDeque::new()),
            event_loop: Mutex::new(VecDeque::new()),
            cpu: Mutex::new(VecDeque::new()),
            client: Mutex::new(VecDeque::new()),
            client_errors: AtomicU64::new(0),
            client_requests: AtomicU64::new(0),
            stop: Notify::new(),
        }
    }

    #[must_use]
    pub fn shared(options: SnapshotterOptions) -> Arc<Self> {
        Arc::new(Self::new(options))
    }

    /// Record one observed response; `rate_limited` marks 429-style blocks.
    pub fn note_client_response(&self, rate_limited: bool) {
        self.client_requests.fetch_add(1, Ordering::Relaxed);
        if rate_limited {
            self.client_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Samples for `resource` not older than `window`.
    #[must_use]
    pub fn samples_since(&self, resource: Resource, window: Duration) -> Vec<Sample> {
        let series = match resource {
            Resource::Memory => &self.memory,
            Resource::EventLoop => &self.event_loop,
            Resource::Cpu => &self.cpu,
            Resource::Client => &self.client,
        };
        let cutoff = Instant::now().checked_sub(window);
        let series = series.lock();
        series
            .iter()
            .filter(|s| cutoff.is_none_or(|c| s.created_at >= c))
            .copied()
            .collect()
    }

    /// Inject one sample directly. Used by tests and by embedders that have
    /// their own measurement source.
    pub fn push_sample(&self, resource: Resource, is_overloaded: bool) {
        let sample = Sample {
            created_at: Instant::now(),
            is_overloaded,
        };
        let series = match resource {
            Resource::Memory => &self.memory,
            Resource::EventLoop => &self.event_loop,
            Resource::Cpu => &self.cpu,
            Resource::Client => &self.client,
        };
        let mut series = series.lock();
        series.push_back(sample);
        Self::prune(&mut series, self.options.history);
    }

    fn prune(series: &mut VecDeque<Sample>, history: Duration) {
        let cutoff = Instant::now().checked_sub(history);
        if let Some(cutoff) = cutoff {
            while series.front().is_some_and(|s| s.created_at < cutoff) {
                series.pop_front();
            }
        }
    }

    /// Spawn the sampling tasks. They stop when
    /// [`stop_sampling`](Self::stop_sampling) is called or the event bus
    /// closes.
    pub fn start(self: Arc<Self>, bus: &Arc<EventBus>) -> Vec<JoinHandle<()>> {
        vec![
            Self::spawn_memory_and_client_sampler(Arc::clone(&self)),
            Self::spawn_event_loop_sampler(Arc::clone(&self)),
            Self::spawn_cpu_listener(self, bus),
        ]
    }

    /// Stop all sampling tasks.
    pub fn stop_sampling(&self) {
        self.stop.notify_waiters();
    }

    fn spawn_memory_and_client_sampler(snapshotter: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(snapshotter.options.snapshot_interval);
            let mut last_errors = 0u64;
            let mut last_requests = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        snapshotter.sample_memory();
                        snapshotter.sample_cpu();
                        (last_errors, last_requests) =
                            snapshotter.sample_client(last_errors, last_requests);
                    }
                    _ = snapshotter.stop.notified() => break,
                }
            }
        })
    }

    fn sample_memory(&self) {
        let overloaded = match memory_info() {
            Some((total, available)) => {
                let used_ratio = 1.0 - (available as f64 / total as f64);
                trace!("memory sample: {:.1}% used", used_ratio * 100.0);
                used_ratio > self.options.max_used_memory_ratio
            }
            None => false,
        };
        self.push_sample(Resource::Memory, overloaded);
    }

    /// Local CPU probe: one-minute load average normalized by core count.
    ///
    /// Supplements the externally-published `SystemInfo` readings; on
    /// platforms without a load average the series is fed by events alone.
    fn sample_cpu(&self) {
        let Some(load) = load_average_1m() else {
            return;
        };
        let per_core = load / num_cpus::get() as f64;
        self.push_sample(Resource::Cpu, per_core > self.options.max_cpu_load_ratio);
    }

    fn sample_client(&self, last_errors: u64, last_requests: u64) -> (u64, u64) {
        let errors = self.client_errors.load(Ordering::Relaxed);
        let requests = self.client_requests.load(Ordering::Relaxed);
        let error_delta = errors.saturating_sub(last_errors);
        let request_delta = requests.saturating_sub(last_requests);

        let overloaded = request_delta > 0
            && (error_delta as f64 / request_delta as f64) > self.options.max_client_error_ratio;
        self.push_sample(Resource::Client, overloaded);
        (errors, requests)
    }

    fn spawn_event_loop_sampler(snapshotter: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = snapshotter.options.event_loop_interval;
            let max_drift = Duration::from_millis(snapshotter.options.max_blocked_millis);
            loop {
                let before = Instant::now();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = snapshotter.stop.notified() => break,
                }
                // Drift beyond the requested sleep means the executor was
                // busy servicing other work.
                let drift = before.elapsed().saturating_sub(interval);
                let overloaded = drift > max_drift;
                if overloaded {
                    debug!("event loop drifted {drift:?} past its {interval:?} tick");
                }
                snapshotter.push_sample(Resource::EventLoop, overloaded);
            }
        })
    }

    fn spawn_cpu_listener(snapshotter: Arc<Self>, bus: &Arc<EventBus>) -> JoinHandle<()> {
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = receiver.recv() => match event {
                        Ok(SystemEvent::SystemInfo(load)) => {
                            snapshotter.push_sample(Resource::Cpu, load.is_cpu_overloaded);
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    },
                    _ = snapshotter.stop.notified() => break,
                }
            }
        })
    }
}

/// Read the one-minute load average from the OS, when possible.
fn load_average_1m() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
        return loadavg.split_whitespace().next()?.parse().ok();
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Read `(total_bytes, available_bytes)` from the OS, when possible.
fn memory_info() -> Option<(u64, u64)> {
    #[cfg(target_os = "linux")]
    {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total = None;
        let mut available = None;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total = rest.split_whitespace().next()?.parse::<u64>().ok();
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available = rest.split_whitespace().next()?.parse::<u64>().ok();
            }
        }
        // /proc/meminfo reports KiB.
        return Some((total? * 1024, available? * 1024));
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_windowed() {
        let snapshotter = Snapshotter::new(SnapshotterOptions::default());
        snapshotter.push_sample(Resource::Memory, false);
        snapshotter.push_sample(Resource::Memory, true);

        let samples = snapshotter.samples_since(Resource::Memory, Duration::from_secs(10));
        assert_eq!(samples.len(), 2);
        assert!(samples[1].is_overloaded);

        let none = snapshotter.samples_since(Resource::Memory, Duration::ZERO);
        assert!(none.len() <= 2);
    }

    #[test]
    fn client_ratio_flags_overload() {
        let snapshotter = Snapshotter::new(SnapshotterOptions {
            max_client_error_ratio: 0.1,
            ..SnapshotterOptions::default()
        });
        for _ in 0..8 {
            snapshotter.note_client_response(false);
        }
        for _ in 0..2 {
            snapshotter.note_client_response(true);
        }

        let (errors, requests) = (0, 0);
        let _ = snapshotter.sample_client(errors, requests);
        let samples = snapshotter.samples_since(Resource::Client, Duration::from_secs(10));
        assert_eq!(samples.len(), 1);
        // 2 errors / 10 requests = 0.2 > 0.1
        assert!(samples[0].is_overloaded);
    }

    #[tokio::test]
    async fn cpu_listener_consumes_system_info_events() {
        let bus = EventBus::shared(16);
        let snapshotter = Snapshotter::shared(SnapshotterOptions::default());
        let handles = Arc::clone(&snapshotter).start(&bus);

        bus.publish(SystemEvent::SystemInfo(crate::events::SystemLoad::new(
            0.95, true,
        )))
        .expect("publish");

        // Give the listener a moment to pick the event up. The local load
        // probe may add idle samples of its own, so only assert on the
        // event's contribution.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let samples = snapshotter.samples_since(Resource::Cpu, Duration::from_secs(10));
        assert!(!samples.is_empty());
        assert!(samples.iter().any(|s| s.is_overloaded));

        snapshotter.stop_sampling();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
