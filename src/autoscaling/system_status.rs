//! Overload verdicts over snapshot windows
//!
//! Turns the snapshotter's raw sample series into per-resource overload
//! ratios and an overall idle/overloaded verdict, over a short "current"
//! window (recent seconds) or the full retained history.

use std::sync::Arc;
use std::time::Duration;

use super::snapshotter::{Resource, Sample, Snapshotter};

/// Per-resource thresholds: a resource counts as overloaded when the
/// fraction of overloaded samples in the window exceeds its limit.
#[derive(Debug, Clone)]
pub struct SystemStatusOptions {
    /// Window for [`SystemStatus::current_status`].
    pub current_history: Duration,
    pub max_memory_overloaded_ratio: f64,
    pub max_event_loop_overloaded_ratio: f64,
    pub max_cpu_overloaded_ratio: f64,
    pub max_client_overloaded_ratio: f64,
}

impl Default for SystemStatusOptions {
    fn default() -> Self {
        Self {
            current_history: Duration::from_secs(5),
            max_memory_overloaded_ratio: 0.2,
            max_event_loop_overloaded_ratio: 0.6,
            max_cpu_overloaded_ratio: 0.4,
            max_client_overloaded_ratio: 0.3,
        }
    }
}

/// Overload verdict for one resource.
#[derive(Debug, Clone, Copy)]
pub struct LoadRatioInfo {
    pub is_overloaded: bool,
    /// Threshold the ratio was compared against.
    pub limit_ratio: f64,
    /// Fraction of overloaded samples in the window.
    pub actual_ratio: f64,
}

/// Combined verdict across all resources.
#[derive(Debug, Clone, Copy)]
pub struct SystemStatusInfo {
    pub is_system_idle: bool,
    pub memory: LoadRatioInfo,
    pub event_loop: LoadRatioInfo,
    pub cpu: LoadRatioInfo,
    pub client: LoadRatioInfo,
}

/// Computes verdicts from a shared [`Snapshotter`].
pub struct SystemStatus {
    snapshotter: Arc<Snapshotter>,
    options: SystemStatusOptions,
}

impl SystemStatus {
    #[must_use]
    pub fn new(snapshotter: Arc<Snapshotter>, options: SystemStatusOptions) -> Self {
        Self {
            snapshotter,
            options,
        }
    }

    /// Verdict over the short current window.
    #[must_use]
    pub fn current_status(&self) -> SystemStatusInfo {
        self.status_for_window(self.options.current_history)
    }

    /// Verdict over the whole retained history.
    #[must_use]
    pub fn historical_status(&self) -> SystemStatusInfo {
        self.status_for_window(Duration::MAX)
    }

    /// True when any resource was overloaded within the current window.
    #[must_use]
    pub fn has_been_overloaded_recently(&self) -> bool {
        !self.current_status().is_system_idle
    }

    fn status_for_window(&self, window: Duration) -> SystemStatusInfo {
        let memory = self.ratio_for(
            Resource::Memory,
            window,
            self.options.max_memory_overloaded_ratio,
        );
        let event_loop = self.ratio_for(
            Resource::EventLoop,
            window,
            self.options.max_event_loop_overloaded_ratio,
        );
        let cpu = self.ratio_for(Resource::Cpu, window, self.options.max_cpu_overloaded_ratio);
        let client = self.ratio_for(
            Resource::Client,
            window,
            self.options.max_client_overloaded_ratio,
        );

        SystemStatusInfo {
            is_system_idle: !memory.is_overloaded
                && !event_loop.is_overloaded
                && !cpu.is_overloaded
                && !client.is_overloaded,
            memory,
            event_loop,
            cpu,
            client,
        }
    }

    fn ratio_for(&self, resource: Resource, window: Duration, limit: f64) -> LoadRatioInfo {
        let samples = self.snapshotter.samples_since(resource, window);
        let actual = overloaded_fraction(&samples);
        LoadRatioInfo {
            is_overloaded: actual > limit,
            limit_ratio: limit,
            actual_ratio: actual,
        }
    }
}

/// Fraction of samples flagged overloaded; an empty window counts as idle.
fn overloaded_fraction(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let overloaded = samples.iter().filter(|s| s.is_overloaded).count();
    overloaded as f64 / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaling::snapshotter::SnapshotterOptions;

    fn status_with_samples(overloaded: usize, idle: usize) -> SystemStatus {
        let snapshotter = Snapshotter::shared(SnapshotterOptions::default());
        for _ in 0..overloaded {
            snapshotter.push_sample(Resource::EventLoop, true);
        }
        for _ in 0..idle {
            snapshotter.push_sample(Resource::EventLoop, false);
        }
        SystemStatus::new(snapshotter, SystemStatusOptions::default())
    }

    #[test]
    fn empty_history_reads_as_idle() {
        let status = status_with_samples(0, 0);
        assert!(status.current_status().is_system_idle);
        assert!(!status.has_been_overloaded_recently());
    }

    #[test]
    fn sustained_overload_flips_verdict() {
        // 8 of 10 event-loop samples overloaded: 0.8 > 0.6 limit.
        let status = status_with_samples(8, 2);
        let info = status.current_status();
        assert!(!info.is_system_idle);
        assert!(info.event_loop.is_overloaded);
        assert!((info.event_loop.actual_ratio - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn occasional_overload_stays_idle() {
        // 2 of 10 samples: 0.2 < 0.6 limit.
        let status = status_with_samples(2, 8);
        assert!(status.current_status().is_system_idle);
    }
}
