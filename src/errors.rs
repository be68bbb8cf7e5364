//! Error taxonomy for the crawling engine
//!
//! Marker types classify how a failure is handled: retried, final, session
//! rotation, or immediate crawl termination. Handlers and middlewares return
//! `anyhow::Result`, and the crawler classifies errors by downcasting through
//! the chain.

use std::time::Duration;

/// Marker for errors that must never be retried.
///
/// A request failing with this error goes straight to the final-failure path
/// regardless of its remaining retry budget.
#[derive(Debug, thiserror::Error)]
#[error("non-retryable: {message}")]
pub struct NonRetryableError {
    pub message: String,
}

impl NonRetryableError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Marker that forces a retry regardless of the retry count.
#[derive(Debug, thiserror::Error)]
#[error("retry requested: {message}")]
pub struct RetryRequestError {
    pub message: String,
}

impl RetryRequestError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The current session was blocked or is no longer viable.
///
/// The crawler retires the session and reclaims the request so it runs again
/// with a fresh identity. Not counted as a failure unless retries exhaust.
#[derive(Debug, thiserror::Error)]
#[error("session rotation required: {message}")]
pub struct SessionError {
    pub message: String,
}

impl SessionError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Session error produced by a blocked HTTP status code.
    #[must_use]
    pub fn blocked_status(status: u16) -> Self {
        Self {
            message: format!("request blocked with status code {status}"),
        }
    }
}

/// Terminates the whole crawl immediately.
#[derive(Debug, thiserror::Error)]
#[error("critical error, aborting crawl: {message}")]
pub struct CriticalError {
    pub message: String,
}

impl CriticalError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A time-boxed operation exceeded its deadline.
///
/// Treated as a transient error: retried until the retry budget runs out.
#[derive(Debug, thiserror::Error)]
#[error("{operation} timed out after {timeout:?}")]
pub struct TimeoutError {
    pub operation: String,
    pub timeout: Duration,
}

impl TimeoutError {
    #[must_use]
    pub fn new(operation: impl Into<String>, timeout: Duration) -> Self {
        Self {
            operation: operation.into(),
            timeout,
        }
    }
}

/// Intentional interruption of a pipeline run (pause, migration).
///
/// Propagates as-is through the pipeline without being wrapped.
#[derive(Debug, thiserror::Error)]
#[error("interrupted")]
pub struct InterruptedError;

/// A middleware action failed before the consumer ran.
///
/// Wraps any action error other than [`SessionError`] and
/// [`InterruptedError`], which pass through unchanged.
#[derive(Debug, thiserror::Error)]
#[error("middleware initialization failed: {0}")]
pub struct InitializationError(pub anyhow::Error);

/// The final consumer (user handler) failed.
#[derive(Debug, thiserror::Error)]
#[error("request handler failed: {0}")]
pub struct HandlerError(pub anyhow::Error);

/// One or more pipeline cleanups failed while unwinding.
///
/// Supersedes normal completion but never replaces a prior [`SessionError`].
#[derive(Debug, thiserror::Error)]
#[error("{} cleanup step(s) failed: {}", .failures.len(), format_failures(.failures))]
pub struct CleanupError {
    pub failures: Vec<anyhow::Error>,
}

fn format_failures(failures: &[anyhow::Error]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Strip pipeline wrappers so classification sees the underlying error.
fn unwrapped(err: &anyhow::Error) -> &anyhow::Error {
    if let Some(wrapped) = err.downcast_ref::<HandlerError>() {
        return unwrapped(&wrapped.0);
    }
    if let Some(wrapped) = err.downcast_ref::<InitializationError>() {
        return unwrapped(&wrapped.0);
    }
    err
}

/// True if the error chain contains a [`SessionError`].
#[must_use]
pub fn is_session_error(err: &anyhow::Error) -> bool {
    unwrapped(err).downcast_ref::<SessionError>().is_some()
}

/// True if the error chain contains a [`NonRetryableError`].
#[must_use]
pub fn is_non_retryable(err: &anyhow::Error) -> bool {
    unwrapped(err).downcast_ref::<NonRetryableError>().is_some()
}

/// True if the error chain contains a [`RetryRequestError`].
#[must_use]
pub fn is_retry_request(err: &anyhow::Error) -> bool {
    unwrapped(err).downcast_ref::<RetryRequestError>().is_some()
}

/// True if the error chain contains a [`CriticalError`].
#[must_use]
pub fn is_critical(err: &anyhow::Error) -> bool {
    unwrapped(err).downcast_ref::<CriticalError>().is_some()
}

/// True if the error chain contains a [`TimeoutError`].
#[must_use]
pub fn is_timeout(err: &anyhow::Error) -> bool {
    unwrapped(err).downcast_ref::<TimeoutError>().is_some()
}

/// True if the error chain contains an [`InterruptedError`].
#[must_use]
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    unwrapped(err).downcast_ref::<InterruptedError>().is_some()
}
