//! Per-request crawling context and its capability handle
//!
//! The context is assembled fresh for every dispatched request and dropped
//! on task exit. Crawler facilities reach the context through a narrow
//! capability handle rather than a back-reference to the crawler itself,
//! so contexts never form ownership cycles with the active-contexts map.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::errors::SessionError;
use crate::pipeline::{Extendable, Extensions};
use crate::request::Request;
use crate::request_queue::RequestQueue;
use crate::session::Session;
use crate::stats::Statistics;
use crate::storage::{AddRequestResult, Dataset, KeyValueStore, SHARED_STATE_KEY};
use crate::autoscaling::Snapshotter;

/// Proxy configuration attached to a context, when one is in use.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    pub url: String,
}

/// Narrow capability object giving contexts access to crawler facilities.
///
/// Deliberately small: storage, queue, HTTP client and counters, nothing
/// that could keep a whole crawler alive from inside a context.
pub struct CrawlerHandle {
    pub(crate) kv: Arc<dyn KeyValueStore>,
    pub(crate) dataset: Arc<dyn Dataset>,
    pub(crate) queue: Arc<RequestQueue>,
    pub(crate) http: reqwest::Client,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) snapshotter: Option<Arc<Snapshotter>>,
}

/// Everything a handler gets for one request.
pub struct CrawlingContext {
    pub id: String,
    pub request: Request,
    pub session: Option<Arc<Session>>,
    pub proxy_info: Option<ProxyInfo>,
    pub extensions: Extensions,
    handle: Arc<CrawlerHandle>,
}

impl Extendable for CrawlingContext {
    fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

impl CrawlingContext {
    #[must_use]
    pub(crate) fn new(
        request: Request,
        session: Option<Arc<Session>>,
        handle: Arc<CrawlerHandle>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            session,
            proxy_info: None,
            extensions: Extensions::new(),
            handle,
        }
    }

    /// Log target string carrying the request identity.
    #[must_use]
    pub fn log_target(&self) -> String {
        format!(
            "crawler[{}]",
            self.request.id.as_deref().unwrap_or(&self.request.unique_key)
        )
    }

    /// Append one result item to the dataset.
    pub async fn push_data(&self, item: serde_json::Value) -> Result<()> {
        self.handle.dataset.push_data(vec![item]).await
    }

    /// Enqueue follow-up requests for this crawl.
    pub async fn add_requests(&self, requests: Vec<Request>) -> Result<Vec<AddRequestResult>> {
        self.handle.queue.batch_add_requests(requests, false).await
    }

    /// The key-value store backing this crawl.
    #[must_use]
    pub fn get_key_value_store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.handle.kv)
    }

    /// Read the shared crawl state, falling back to `default` when unset.
    pub async fn use_state(&self, default: serde_json::Value) -> Result<serde_json::Value> {
        match self.handle.kv.get_value(SHARED_STATE_KEY).await? {
            Some(value) => Ok(value),
            None => {
                self.handle
                    .kv
                    .set_value(SHARED_STATE_KEY, default.clone())
                    .await?;
                Ok(default)
            }
        }
    }

    /// Overwrite the shared crawl state.
    pub async fn set_state(&self, value: serde_json::Value) -> Result<()> {
        self.handle.kv.set_value(SHARED_STATE_KEY, value).await
    }

    /// Fire this context's request over HTTP.
    ///
    /// Session cookies and fingerprint headers are attached when a session
    /// is present. Status codes feed the statistics and the client-error
    /// snapshots; a blocked status (per the session's blocked codes)
    /// retires the session and surfaces as a [`SessionError`] so the
    /// request is retried on a fresh identity.
    pub async fn send_request(&self) -> Result<reqwest::Response> {
        let method = reqwest::Method::from_str(&self.request.method)
            .with_context(|| format!("invalid HTTP method '{}'", self.request.method))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.request.headers {
            let name = HeaderName::from_str(name)
                .with_context(|| format!("invalid header name '{name}'"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header '{name}'"))?;
            headers.insert(name, value);
        }

        if let Some(session) = &self.session {
            if let Some(agent) = session
                .fingerprint()
                .and_then(|fp| fp.get("userAgent"))
                .and_then(|ua| ua.as_str())
                && !headers.contains_key(reqwest::header::USER_AGENT)
                && let Ok(value) = HeaderValue::from_str(agent)
            {
                headers.insert(reqwest::header::USER_AGENT, value);
            }
            let cookies = session.cookies();
            if !cookies.is_empty()
                && let Ok(value) = HeaderValue::from_str(
                    &cookies
                        .iter()
                        .map(|(k, v)| format!("{k}={v}"))
                        .collect::<Vec<_>>()
                        .join("; "),
                )
            {
                headers.insert(reqwest::header::COOKIE, value);
            }
        }

        let mut builder = self
            .handle
            .http
            .request(method, self.request.url.as_str())
            .headers(headers);
        if let Some(payload) = &self.request.payload {
            builder = builder.body(payload.clone());
        }

        let response = builder.send().await.context("request transport failed")?;
        let status = response.status().as_u16();

        self.handle.stats.track_status_code(status);
        if let Some(snapshotter) = &self.handle.snapshotter {
            snapshotter.note_client_response(status == 429);
        }

        if let Some(session) = &self.session
            && session.retire_on_blocked_status_codes(status)
        {
            return Err(SessionError::blocked_status(status).into());
        }

        Ok(response)
    }
}
