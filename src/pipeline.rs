//! Composable context-enrichment pipeline
//!
//! A pipeline is an ordered chain of middlewares, each an `action` that
//! produces typed extensions for the crawling context and an optional
//! `cleanup`. Cleanups run in reverse registration order on every exit
//! path, exactly once per successful action, so middleware-acquired
//! resources (streams, pages) are always released.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use log::debug;

use crate::errors::{CleanupError, HandlerError, InitializationError, is_interrupted, is_session_error};

/// Type-keyed bag of values middlewares attach to a context.
///
/// One value per type: middlewares define small newtype wrappers for the
/// things they contribute (response, body, parsed document, page handle).
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous one of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|prev| prev.downcast().ok())
            .map(|boxed| *boxed)
    }

    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast().ok())
            .map(|boxed| *boxed)
    }

    #[must_use]
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Merge another bag into this one; overriding keys is allowed but
    /// counted so callers can flag accidental collisions.
    pub fn merge(&mut self, other: Extensions) -> usize {
        let mut overridden = 0;
        for (key, value) in other.map {
            if self.map.insert(key, value).is_some() {
                overridden += 1;
            }
        }
        overridden
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Contexts a pipeline can extend.
pub trait Extendable {
    fn extensions_mut(&mut self) -> &mut Extensions;
}

type ActionFn<C> = Box<dyn for<'a> Fn(&'a C) -> BoxFuture<'a, Result<Extensions>> + Send + Sync>;
type CleanupFn<C> = Box<
    dyn for<'a> Fn(&'a mut C, Option<&'a anyhow::Error>) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

/// One pipeline step: an enriching action and its optional cleanup.
pub struct Middleware<C> {
    name: String,
    action: ActionFn<C>,
    cleanup: Option<CleanupFn<C>>,
}

impl<C> Middleware<C> {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a C) -> BoxFuture<'a, Result<Extensions>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
            cleanup: None,
        }
    }

    /// Attach a cleanup; it receives the consumer error, if any.
    #[must_use]
    pub fn with_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: for<'a> Fn(&'a mut C, Option<&'a anyhow::Error>) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Ordered middleware chain.
///
/// `compose` is non-destructive: the new pipeline shares the existing
/// middlewares, so a base pipeline can fan out into specialized variants.
pub struct ContextPipeline<C> {
    middlewares: Vec<Arc<Middleware<C>>>,
}

impl<C: Extendable> Default for ContextPipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Clone for ContextPipeline<C> {
    fn clone(&self) -> Self {
        Self {
            middlewares: self.middlewares.clone(),
        }
    }
}

impl<C: Extendable> ContextPipeline<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    /// Extend the chain with one more middleware, returning the new head.
    #[must_use]
    pub fn compose(mut self, middleware: Middleware<C>) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run every action in order, then the final consumer, then unwind
    /// cleanups LIFO.
    ///
    /// Error wrapping: a failed action propagates `SessionError` and
    /// interruptions as-is and wraps everything else in
    /// [`InitializationError`]; a failed consumer is wrapped in
    /// [`HandlerError`] (again excepting `SessionError`). Cleanup failures
    /// aggregate into a [`CleanupError`] that supersedes any outcome except
    /// a `SessionError`.
    pub async fn run<F>(&self, context: &mut C, consumer: F) -> Result<()>
    where
        F: for<'a> FnOnce(&'a mut C) -> BoxFuture<'a, Result<()>>,
    {
        let mut completed: Vec<&Arc<Middleware<C>>> = Vec::new();
        let mut outcome: Result<()> = Ok(());

        for middleware in &self.middlewares {
            match (middleware.action)(context).await {
                Ok(extensions) => {
                    let overridden = context.extensions_mut().merge(extensions);
                    if overridden > 0 {
                        debug!(
                            "middleware '{}' overrode {overridden} existing extension(s)",
                            middleware.name
                        );
                    }
                    completed.push(middleware);
                }
                Err(err) => {
                    outcome = Err(if is_session_error(&err) || is_interrupted(&err) {
                        err
                    } else {
                        InitializationError(err).into()
                    });
                    break;
                }
            }
        }

        if outcome.is_ok()
            && let Err(err) = consumer(context).await
        {
            outcome = Err(if is_session_error(&err) {
                err
            } else {
                HandlerError(err).into()
            });
        }

        let mut cleanup_failures: Vec<anyhow::Error> = Vec::new();
        for middleware in completed.iter().rev() {
            let Some(cleanup) = &middleware.cleanup else {
                continue;
            };
            let failure = outcome.as_ref().err();
            if let Err(err) = cleanup(context, failure).await {
                debug!("cleanup of '{}' failed: {err}", middleware.name);
                cleanup_failures.push(err);
            }
        }

        if !cleanup_failures.is_empty() {
            let keep_original = outcome
                .as_ref()
                .err()
                .is_some_and(is_session_error);
            if !keep_original {
                outcome = Err(CleanupError {
                    failures: cleanup_failures,
                }
                .into());
            }
        }

        outcome
    }
}

/// Convenience for building an extension bag with one value.
#[must_use]
pub fn extension<T: Send + Sync + 'static>(value: T) -> Extensions {
    let mut extensions = Extensions::new();
    extensions.insert(value);
    extensions
}
