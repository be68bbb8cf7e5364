//! Request entity and unique-key derivation
//!
//! A [`Request`] is the unit of work flowing through the engine. Its
//! `unique_key` (by default the normalized URL) is what the queue
//! deduplicates on; callers may override it to admit deliberate duplicates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Lifecycle state of a request as it moves through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    #[default]
    Unprocessed,
    BeforeNav,
    AfterNav,
    RequestHandler,
    ErrorHandler,
    Done,
    Error,
}

/// A unit of crawl work: a URL plus everything needed to fetch and track it.
///
/// Invariants: `unique_key` is stable across retries, `retry_count` is
/// monotonically non-decreasing, and once `handled_at` is set the request
/// is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Assigned by the queue on first insert; `None` until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Deduplication key; defaults to the normalized URL.
    pub unique_key: String,
    pub url: String,
    /// The URL the transport actually ended up on (after redirects).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_url: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    /// Header names are stored lowercased so merges are case-insensitive.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Opaque user data; the label router dispatches on `user_data["label"]`.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub user_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub retry_count: u32,
    /// Ordered, append-only record of every error this request hit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_messages: Vec<String>,
    #[serde(default)]
    pub no_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: RequestState,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Request {
    /// Create a request for `url` with the default unique key (normalized URL).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let unique_key = unique_key_from_url(&url);
        Self {
            id: None,
            unique_key,
            url,
            loaded_url: None,
            method: default_method(),
            headers: BTreeMap::new(),
            payload: None,
            user_data: serde_json::Map::new(),
            retry_count: 0,
            error_messages: Vec::new(),
            no_retry: false,
            handled_at: None,
            state: RequestState::Unprocessed,
        }
    }

    /// Override the deduplication key, admitting deliberate duplicates.
    #[must_use]
    pub fn with_unique_key(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = unique_key.into();
        self
    }

    /// Set the router label (`user_data["label"]`).
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.user_data
            .insert("label".to_string(), serde_json::Value::String(label.into()));
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    #[must_use]
    pub fn with_no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    #[must_use]
    pub fn with_user_data(mut self, user_data: serde_json::Map<String, serde_json::Value>) -> Self {
        self.user_data = user_data;
        self
    }

    /// Merge a header, lowercasing the name so lookups are case-insensitive.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Router label, if one was set.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.user_data.get("label").and_then(|v| v.as_str())
    }

    /// Append an error message to the ordered record.
    pub fn push_error_message(&mut self, message: impl Into<String>) {
        self.error_messages.push(message.into());
    }

    /// A request with `handled_at` set is terminal.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }
}

/// Derive the default unique key from a URL.
///
/// Normalization: lowercase scheme and host (the parser does both), strip
/// the fragment, strip a trailing slash from the path, drop `utm_*` query
/// parameters and sort the rest. Unparseable input falls back to the
/// trimmed raw string.
#[must_use]
pub fn unique_key_from_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    url.set_fragment(None);

    // A trailing slash on the path is not significant for deduplication.
    // Trim it on the path component itself so a query string appended
    // below cannot mask it.
    let trimmed_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&trimmed_path);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.to_ascii_lowercase().starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            serializer.append_pair(k, v);
        }
        let query = serializer.finish();
        url.set_query(Some(&query));
    }

    let mut out = url.to_string();
    // The parser restores "/" for an emptied root path; strip that too.
    if out.ends_with('/') {
        out.pop();
    }
    out
}
