//! Event type definitions for the engine event bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signals carried on the process-wide event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemEvent {
    /// Periodic (and shutdown-time) request to persist engine state.
    ///
    /// `is_migrating` is true when the persist was triggered by an imminent
    /// migration rather than the regular interval.
    PersistState { is_migrating: bool },
    /// The process will terminate soon; quiesce and persist.
    Migrating,
    /// The crawl is being aborted.
    Aborting,
    /// External measurement of system load, consumed by the snapshotter.
    SystemInfo(SystemLoad),
}

impl SystemEvent {
    /// Short name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::PersistState { .. } => "persistState",
            Self::Migrating => "migrating",
            Self::Aborting => "aborting",
            Self::SystemInfo(_) => "systemInfo",
        }
    }
}

/// One externally-sampled load reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemLoad {
    pub created_at: DateTime<Utc>,
    /// CPU utilization in `[0, 1]`; values above 1 mean oversubscription.
    pub cpu_current_usage: f64,
    pub is_cpu_overloaded: bool,
    /// Fraction of memory in use, when the source reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_current_ratio: Option<f64>,
}

impl SystemLoad {
    #[must_use]
    pub fn new(cpu_current_usage: f64, is_cpu_overloaded: bool) -> Self {
        Self {
            created_at: Utc::now(),
            cpu_current_usage,
            is_cpu_overloaded,
            memory_current_ratio: None,
        }
    }
}
