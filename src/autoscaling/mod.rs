//! Adaptive concurrency: snapshots, verdicts, and the worker pool
//!
//! [`Snapshotter`] collects rolling load samples, [`SystemStatus`] turns
//! them into idle/overloaded verdicts, and [`AutoscaledPool`] uses those
//! verdicts to grow or shrink its worker concurrency within bounds.

pub mod pool;
pub mod snapshotter;
pub mod system_status;

pub use pool::{
    AutoscaledPool, AutoscaledPoolOptions, IsFinishedFn, IsTaskReadyFn, RunTaskFn,
};
pub use snapshotter::{Resource, Sample, Snapshotter, SnapshotterOptions};
pub use system_status::{LoadRatioInfo, SystemStatus, SystemStatusInfo, SystemStatusOptions};
