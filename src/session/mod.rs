//! Sessions: rotating crawl identities
//!
//! A session bundles the state one "identity" accumulates across requests:
//! cookies, a fingerprint, usage and error scores. Sessions are shared
//! across tasks behind `Arc`, so all mutable state lives behind a short
//! non-suspending lock.

pub mod pool;

pub use pool::{SessionPool, SessionFactory};

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionPoolConfig;

/// How much one `mark_good` call repairs the error score.
const ERROR_SCORE_DECREMENT: f64 = 0.5;

#[derive(Debug)]
struct SessionInner {
    usage_count: u32,
    error_score: f64,
    retired: bool,
    cookies: BTreeMap<String, String>,
}

/// One crawl identity with scoring and expiry.
///
/// A session becomes unusable when any of: usage exhausted, error score at
/// the cap, expired, or explicitly retired.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: Instant,
    max_age: Duration,
    max_usage_count: u32,
    max_error_score: f64,
    blocked_status_codes: Vec<u16>,
    fingerprint: Option<serde_json::Value>,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// New session configured from pool settings.
    #[must_use]
    pub fn new(config: &SessionPoolConfig) -> Self {
        Self {
            id: format!("session_{}", Uuid::new_v4()),
            created_at: Instant::now(),
            max_age: config.max_age(),
            max_usage_count: config.max_usage_count(),
            max_error_score: config.max_error_score(),
            blocked_status_codes: config.blocked_status_codes().to_vec(),
            fingerprint: None,
            inner: Mutex::new(SessionInner {
                usage_count: 0,
                error_score: 0.0,
                retired: false,
                cookies: BTreeMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: serde_json::Value) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn fingerprint(&self) -> Option<&serde_json::Value> {
        self.fingerprint.as_ref()
    }

    #[must_use]
    pub fn usage_count(&self) -> u32 {
        self.inner.lock().usage_count
    }

    #[must_use]
    pub fn error_score(&self) -> f64 {
        self.inner.lock().error_score
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.max_age
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.inner.lock().retired
    }

    /// Usable right now: not retired, not expired, usage and score in range.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        let inner = self.inner.lock();
        !inner.retired
            && !self.is_expired()
            && inner.usage_count < self.max_usage_count
            && inner.error_score < self.max_error_score
    }

    /// Count one checkout. Called by the pool; a request consumes exactly
    /// one usage regardless of how many good/bad marks it issues.
    pub(crate) fn note_checkout(&self) {
        self.inner.lock().usage_count += 1;
    }

    /// Signal a successful request: partially repair the error score.
    pub fn mark_good(&self) {
        let mut inner = self.inner.lock();
        inner.error_score = (inner.error_score - ERROR_SCORE_DECREMENT).max(0.0);
    }

    /// Signal a failed request: raise the error score by one.
    pub fn mark_bad(&self) {
        self.inner.lock().error_score += 1.0;
    }

    /// Permanently remove this session from rotation.
    pub fn retire(&self) {
        self.inner.lock().retired = true;
    }

    /// Retire if `status` is one of the blocked codes; true when retired.
    pub fn retire_on_blocked_status_codes(&self, status: u16) -> bool {
        if self.blocked_status_codes.contains(&status) {
            self.retire();
            return true;
        }
        false
    }

    #[must_use]
    pub fn is_blocked_status_code(&self, status: u16) -> bool {
        self.blocked_status_codes.contains(&status)
    }

    /// Store a cookie on this identity.
    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().cookies.insert(name.into(), value.into());
    }

    /// Copy of the cookie jar.
    #[must_use]
    pub fn cookies(&self) -> BTreeMap<String, String> {
        self.inner.lock().cookies.clone()
    }

    /// Serializable descriptor for persistence.
    #[must_use]
    pub fn to_state(&self) -> SessionState {
        let inner = self.inner.lock();
        let remaining = self.max_age.saturating_sub(self.created_at.elapsed());
        SessionState {
            id: self.id.clone(),
            usage_count: inner.usage_count,
            error_score: inner.error_score,
            retired: inner.retired,
            expires_at: Utc::now()
                + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero()),
            cookies: inner.cookies.clone(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    /// Rebuild a session from a persisted descriptor.
    #[must_use]
    pub fn from_state(config: &SessionPoolConfig, state: SessionState) -> Self {
        let remaining = (state.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        // Recreate with the same remaining lifetime by shrinking max_age.
        Self {
            id: state.id,
            created_at: Instant::now(),
            max_age: remaining,
            max_usage_count: config.max_usage_count(),
            max_error_score: config.max_error_score(),
            blocked_status_codes: config.blocked_status_codes().to_vec(),
            fingerprint: state.fingerprint,
            inner: Mutex::new(SessionInner {
                usage_count: state.usage_count,
                error_score: state.error_score,
                retired: state.retired,
                cookies: state.cookies,
            }),
        }
    }
}

/// Persisted form of a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub id: String,
    pub usage_count: u32,
    pub error_score: f64,
    pub retired: bool,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<serde_json::Value>,
}
