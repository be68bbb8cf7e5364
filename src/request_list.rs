//! Static, ordered, persistable source of initial work
//!
//! A request list materializes inline entries and remote URL lists into an
//! append-only sequence served exactly once each. Named lists persist both
//! their materialized sources and their progress so a restarted process
//! resumes where it left off.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::request::Request;
use crate::storage::{KeyValueStore, request_list_sources_key, request_list_state_key};

/// Default pattern for extracting URLs from a downloaded list, one per line
/// or embedded in arbitrary text. Commas are excluded so CSV-ish lines
/// don't glue URLs together.
static URL_NO_COMMAS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bhttps?://[^\s"'<>\[\](),]+"#)
        .unwrap_or_else(|e| panic!("default URL regex must compile: {e}"))
});

/// One source feeding a request list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestListSource {
    /// Requests supplied inline.
    Requests(Vec<Request>),
    /// A remote text resource containing URLs, matched by `url_pattern`
    /// (the default pattern when unset).
    RequestsFromUrl {
        list_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url_pattern: Option<String>,
    },
}

/// Persisted progress of a named list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestListState {
    next_index: usize,
    in_progress: Vec<String>,
    reclaimed: Vec<String>,
}

#[derive(Debug, Default)]
struct Progress {
    next_index: usize,
    in_progress: HashSet<String>,
    reclaimed: HashSet<String>,
}

/// In-memory, ordered request source with exactly-once hand-out.
pub struct RequestList {
    name: Option<String>,
    keep_duplicate_urls: bool,
    kv: Option<Arc<dyn KeyValueStore>>,
    sources: Vec<RequestListSource>,
    requests: Mutex<Vec<Request>>,
    progress: Mutex<Progress>,
    initialized: Mutex<bool>,
}

impl RequestList {
    /// Create an uninitialized list; call [`initialize`](Self::initialize)
    /// before serving requests.
    #[must_use]
    pub fn new(sources: Vec<RequestListSource>) -> Self {
        Self {
            name: None,
            keep_duplicate_urls: false,
            kv: None,
            sources,
            requests: Mutex::new(Vec::new()),
            progress: Mutex::new(Progress::default()),
            initialized: Mutex::new(false),
        }
    }

    /// Name the list, enabling state and source persistence.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Keep duplicate URLs instead of deduplicating by unique key.
    #[must_use]
    pub fn with_keep_duplicate_urls(mut self, keep: bool) -> Self {
        self.keep_duplicate_urls = keep;
        self
    }

    /// Attach the key-value store used for persistence.
    #[must_use]
    pub fn with_kv_store(mut self, kv: Arc<dyn KeyValueStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Download remote sources, materialize and deduplicate the request
    /// sequence, and restore persisted progress for named lists.
    pub async fn initialize(&self) -> Result<()> {
        {
            let initialized = self.initialized.lock();
            if *initialized {
                return Ok(());
            }
        }

        let persisted_sources = self.load_persisted_sources().await?;
        let sources = match persisted_sources {
            Some(sources) => {
                debug!("using persisted request list sources");
                sources
            }
            None => {
                let materialized = self.materialize_sources().await?;
                self.persist_sources(&materialized).await?;
                materialized
            }
        };

        let mut seen: HashSet<String> = HashSet::new();
        let mut requests = Vec::new();
        for mut request in sources {
            if !seen.insert(request.unique_key.clone()) {
                if !self.keep_duplicate_urls {
                    continue;
                }
                // Duplicates kept on purpose still need distinct keys for
                // progress tracking.
                let mut n = 1;
                let base = request.unique_key.clone();
                loop {
                    let candidate = format!("{base}|dup:{n}");
                    if seen.insert(candidate.clone()) {
                        request.unique_key = candidate;
                        break;
                    }
                    n += 1;
                }
            }
            requests.push(request);
        }
        let materialized_len = requests.len();
        *self.requests.lock() = requests;

        self.restore_state().await?;
        *self.initialized.lock() = true;
        info!("request list initialized with {materialized_len} request(s)");
        Ok(())
    }

    async fn materialize_sources(&self) -> Result<Vec<Request>> {
        let mut requests = Vec::new();
        for source in &self.sources {
            match source {
                RequestListSource::Requests(list) => requests.extend(list.iter().cloned()),
                RequestListSource::RequestsFromUrl {
                    list_url,
                    url_pattern,
                } => {
                    let downloaded = download_url_list(list_url, url_pattern.as_deref())
                        .await
                        .with_context(|| format!("downloading request list from {list_url}"))?;
                    info!("downloaded {} URL(s) from {list_url}", downloaded.len());
                    requests.extend(downloaded);
                }
            }
        }
        Ok(requests)
    }

    async fn load_persisted_sources(&self) -> Result<Option<Vec<Request>>> {
        let (Some(name), Some(kv)) = (&self.name, &self.kv) else {
            return Ok(None);
        };
        let sources_key = request_list_sources_key(name);
        let state_key = request_list_state_key(name);

        let sources = kv.get_value(&sources_key).await?;
        let state = kv.get_value(&state_key).await?;

        match (sources, state) {
            (Some(sources), _) => {
                let requests: Vec<Request> = serde_json::from_value(sources)
                    .context("persisted request list sources are corrupt")?;
                Ok(Some(requests))
            }
            (None, Some(_)) => {
                // State without sources means the sources changed underneath
                // the saved progress; resuming would serve the wrong work.
                bail!(
                    "request list '{name}' has persisted state but no persisted sources; \
                     clear the state before changing sources"
                )
            }
            (None, None) => Ok(None),
        }
    }

    async fn persist_sources(&self, requests: &[Request]) -> Result<()> {
        let (Some(name), Some(kv)) = (&self.name, &self.kv) else {
            return Ok(());
        };
        let key = request_list_sources_key(name);
        kv.set_value(&key, serde_json::to_value(requests)?).await
    }

    async fn restore_state(&self) -> Result<()> {
        let (Some(name), Some(kv)) = (&self.name, &self.kv) else {
            return Ok(());
        };
        let key = request_list_state_key(name);
        let Some(value) = kv.get_value(&key).await? else {
            return Ok(());
        };
        let state: RequestListState =
            serde_json::from_value(value).context("persisted request list state is corrupt")?;

        {
            let requests = self.requests.lock();
            if state.next_index > requests.len() {
                bail!(
                    "request list '{name}' state points past the end of its sources; \
                     sources changed without clearing state"
                );
            }
            let known: HashSet<&str> = requests.iter().map(|r| r.unique_key.as_str()).collect();
            for key in state.in_progress.iter().chain(state.reclaimed.iter()) {
                if !known.contains(key.as_str()) {
                    bail!(
                        "request list '{name}' state references unknown unique key '{key}'; \
                         sources changed without clearing state"
                    );
                }
            }
        }

        let mut progress = self.progress.lock();
        progress.next_index = state.next_index;
        // Anything in progress when the state was saved never completed;
        // serve it again.
        progress.reclaimed = state
            .in_progress
            .iter()
            .chain(state.reclaimed.iter())
            .cloned()
            .collect();
        progress.in_progress = progress.reclaimed.clone();
        debug!(
            "restored request list state: next_index={}, reclaimed={}",
            state.next_index,
            progress.reclaimed.len()
        );
        Ok(())
    }

    /// Write `{next_index, in_progress, reclaimed}` for named lists.
    pub async fn persist_state(&self) -> Result<()> {
        let (Some(name), Some(kv)) = (&self.name, &self.kv) else {
            return Ok(());
        };
        let state = {
            let progress = self.progress.lock();
            RequestListState {
                next_index: progress.next_index,
                in_progress: progress.in_progress.iter().cloned().collect(),
                reclaimed: progress.reclaimed.iter().cloned().collect(),
            }
        };
        let key = request_list_state_key(name);
        kv.set_value(&key, serde_json::to_value(&state)?).await
    }

    /// Next request, serving reclaimed entries before unseen ones.
    #[must_use]
    pub fn fetch_next_request(&self) -> Option<Request> {
        let requests = self.requests.lock();
        let mut progress = self.progress.lock();

        if let Some(key) = progress.reclaimed.iter().next().cloned() {
            progress.reclaimed.remove(&key);
            let found = requests.iter().find(|r| r.unique_key == key).cloned();
            if found.is_some() {
                return found;
            }
            warn!("reclaimed unique key '{key}' no longer present in list");
        }

        if progress.next_index < requests.len() {
            let request = requests[progress.next_index].clone();
            progress.next_index += 1;
            progress.in_progress.insert(request.unique_key.clone());
            return Some(request);
        }
        None
    }

    /// Mark a served request as done.
    pub fn mark_request_handled(&self, request: &Request) {
        let mut progress = self.progress.lock();
        progress.in_progress.remove(&request.unique_key);
        progress.reclaimed.remove(&request.unique_key);
    }

    /// Return a served request so it is handed out again.
    pub fn reclaim_request(&self, request: &Request) {
        let mut progress = self.progress.lock();
        if progress.in_progress.contains(&request.unique_key) {
            progress.reclaimed.insert(request.unique_key.clone());
        } else {
            warn!(
                "reclaiming request '{}' that is not in progress",
                request.unique_key
            );
        }
    }

    /// No reclaimed entries and no unseen entries left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let total = self.requests.lock().len();
        let progress = self.progress.lock();
        progress.reclaimed.is_empty() && progress.next_index >= total
    }

    /// Empty and nothing in progress.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let total = self.requests.lock().len();
        let progress = self.progress.lock();
        progress.reclaimed.is_empty()
            && progress.in_progress.is_empty()
            && progress.next_index >= total
    }

    /// Requests served and completed so far.
    #[must_use]
    pub fn handled_count(&self) -> usize {
        let progress = self.progress.lock();
        progress.next_index - progress.in_progress.len()
    }

    /// Total materialized requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        *self.initialized.lock()
    }
}

/// Download a text resource and extract request URLs from it.
async fn download_url_list(list_url: &str, url_pattern: Option<&str>) -> Result<Vec<Request>> {
    let pattern = match url_pattern {
        Some(p) => Regex::new(p).with_context(|| format!("invalid URL pattern '{p}'"))?,
        None => URL_NO_COMMAS_REGEX.clone(),
    };

    let body = reqwest::get(list_url)
        .await
        .context("request list download failed")?
        .error_for_status()
        .context("request list download returned an error status")?
        .text()
        .await
        .context("request list body could not be read")?;

    Ok(pattern
        .find_iter(&body)
        .map(|m| Request::new(m.as_str()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline(urls: &[&str]) -> Vec<RequestListSource> {
        vec![RequestListSource::Requests(
            urls.iter().map(|u| Request::new(*u)).collect(),
        )]
    }

    #[tokio::test]
    async fn serves_each_request_exactly_once() {
        let list = RequestList::new(inline(&["https://a/1", "https://a/2"]));
        list.initialize().await.expect("initialize");

        let first = list.fetch_next_request().expect("first");
        let second = list.fetch_next_request().expect("second");
        assert_eq!(first.url, "https://a/1");
        assert_eq!(second.url, "https://a/2");
        assert!(list.fetch_next_request().is_none());

        list.mark_request_handled(&first);
        list.mark_request_handled(&second);
        assert!(list.is_finished());
        assert_eq!(list.handled_count(), 2);
    }

    #[tokio::test]
    async fn deduplicates_by_unique_key() {
        let list = RequestList::new(inline(&["https://a/1", "https://a/1", "https://a/2"]));
        list.initialize().await.expect("initialize");
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn keeps_duplicates_when_asked() {
        let list = RequestList::new(inline(&["https://a/1", "https://a/1"]))
            .with_keep_duplicate_urls(true);
        list.initialize().await.expect("initialize");
        assert_eq!(list.len(), 2);

        let first = list.fetch_next_request().expect("first");
        let second = list.fetch_next_request().expect("second");
        assert_ne!(first.unique_key, second.unique_key);
    }

    #[tokio::test]
    async fn reclaimed_requests_are_served_again_first(){
        let list = RequestList::new(inline(&["https://a/1", "https://a/2"]));
        list.initialize().await.expect("initialize");

        let first = list.fetch_next_request().expect("first");
        list.reclaim_request(&first);

        let again = list.fetch_next_request().expect("served again");
        assert_eq!(again.unique_key, first.unique_key);
    }

    #[test]
    fn default_url_regex_extracts_one_url_per_line() {
        let body = "https://a/1\nhttps://a/2\nnot a url\nhttps://a/3?q=1\n";
        let urls: Vec<&str> = URL_NO_COMMAS_REGEX
            .find_iter(body)
            .map(|m| m.as_str())
            .collect();
        assert_eq!(urls, vec!["https://a/1", "https://a/2", "https://a/3?q=1"]);
    }
}
