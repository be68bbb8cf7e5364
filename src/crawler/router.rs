//! Label-based handler routing
//!
//! The default consumer at the end of the context pipeline: a mapping from
//! `request.user_data["label"]` to a handler, with a default entry for
//! unlabeled requests.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;

use super::context::CrawlingContext;
use crate::errors::NonRetryableError;

/// One user handler.
pub type RequestHandler = Arc<
    dyn for<'a> Fn(&'a mut CrawlingContext) -> BoxFuture<'a, Result<()>> + Send + Sync,
>;

/// Dispatches contexts to handlers by request label.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, RequestHandler>,
    default_handler: Option<RequestHandler>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for one label.
    pub fn add_handler<F>(&mut self, label: impl Into<String>, handler: F)
    where
        F: for<'a> Fn(&'a mut CrawlingContext) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(label.into(), Arc::new(handler));
    }

    /// Register the handler for unlabeled (or unmatched) requests.
    pub fn set_default_handler<F>(&mut self, handler: F)
    where
        F: for<'a> Fn(&'a mut CrawlingContext) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.default_handler = Some(Arc::new(handler));
    }

    #[must_use]
    pub fn has_default_handler(&self) -> bool {
        self.default_handler.is_some()
    }

    /// Route one context to its handler.
    ///
    /// A request whose label has no registered handler and no default is a
    /// configuration error; retrying cannot fix it.
    pub async fn dispatch(&self, context: &mut CrawlingContext) -> Result<()> {
        let label = context.request.label().map(str::to_string);
        let handler = label
            .as_deref()
            .and_then(|l| self.handlers.get(l))
            .or(self.default_handler.as_ref());

        match handler {
            Some(handler) => handler(context).await,
            None => Err(NonRetryableError::new(match label {
                Some(label) => format!("no handler registered for label '{label}'"),
                None => "no default handler registered".to_string(),
            })
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::request_queue::RequestQueue;
    use crate::stats::Statistics;
    use crate::storage::{MemoryDataset, MemoryKeyValueStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_context(request: Request) -> CrawlingContext {
        let handle = Arc::new(super::super::context::CrawlerHandle {
            kv: MemoryKeyValueStore::shared(),
            dataset: MemoryDataset::shared(),
            queue: Arc::new(RequestQueue::in_memory()),
            http: reqwest::Client::new(),
            stats: Arc::new(Statistics::new(0)),
            snapshotter: None,
        });
        CrawlingContext::new(request, None, handle)
    }

    #[tokio::test]
    async fn routes_by_label_with_default_fallback() {
        let labeled = Arc::new(AtomicUsize::new(0));
        let defaulted = Arc::new(AtomicUsize::new(0));

        let mut router = Router::new();
        let counter = Arc::clone(&labeled);
        router.add_handler("detail", move |_ctx| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let counter = Arc::clone(&defaulted);
        router.set_default_handler(move |_ctx| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let mut ctx = test_context(Request::new("https://a/1").with_label("detail"));
        router.dispatch(&mut ctx).await.expect("labeled dispatch");
        let mut ctx = test_context(Request::new("https://a/2"));
        router.dispatch(&mut ctx).await.expect("default dispatch");
        let mut ctx = test_context(Request::new("https://a/3").with_label("unknown"));
        router.dispatch(&mut ctx).await.expect("unknown label falls back");

        assert_eq!(labeled.load(Ordering::SeqCst), 1);
        assert_eq!(defaulted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_handler_is_non_retryable() {
        let router = Router::new();
        let mut ctx = test_context(Request::new("https://a/1"));

        let err = router
            .dispatch(&mut ctx)
            .await
            .expect_err("no handler registered");
        assert!(crate::errors::is_non_retryable(&err));
    }
}
