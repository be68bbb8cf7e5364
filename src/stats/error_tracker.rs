//! Clustered error grouping
//!
//! Errors are grouped into a tree keyed successively by source location,
//! error code, error name and a generalized message. Messages in the same
//! group are merged by longest-common-word-subsequence with `_`
//! placeholders standing in for the parts that differ; a merge that would
//! be more than half placeholders is rejected and the message starts its
//! own group.

use std::collections::HashMap;

use crate::errors::{
    is_critical, is_non_retryable, is_retry_request, is_session_error, is_timeout,
};

const PLACEHOLDER: &str = "_";
const UNKNOWN: &str = "unknown";

/// Flattened view of one error for grouping purposes.
#[derive(Debug, Clone)]
pub struct ErrorSnapshot {
    /// Where the error originated, when known (module path, URL host, …).
    pub source: Option<String>,
    /// Machine-readable code (HTTP status, errno), when known.
    pub code: Option<String>,
    /// Error class name.
    pub name: String,
    pub message: String,
}

impl ErrorSnapshot {
    /// Build a snapshot from an `anyhow` error chain.
    #[must_use]
    pub fn from_error(err: &anyhow::Error) -> Self {
        let name = if is_timeout(err) {
            "TimeoutError"
        } else if is_session_error(err) {
            "SessionError"
        } else if is_non_retryable(err) {
            "NonRetryableError"
        } else if is_retry_request(err) {
            "RetryRequestError"
        } else if is_critical(err) {
            "CriticalError"
        } else {
            "Error"
        };

        // The innermost chain entry is the root cause; its Display is the
        // most specific message we have.
        let message = err
            .chain()
            .last()
            .map_or_else(|| err.to_string(), |cause| cause.to_string());

        Self {
            source: None,
            code: None,
            name: name.to_string(),
            message,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// One aggregated error group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorGroup {
    pub count: u64,
    pub source: String,
    pub code: String,
    pub name: String,
    /// Generalized message; `_` marks the parts that differed.
    pub message: String,
}

#[derive(Debug, Default)]
struct MessageGroup {
    words: Vec<String>,
    count: u64,
}

/// Hierarchical error aggregator.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    /// source → code → name → message groups
    groups: HashMap<String, HashMap<String, HashMap<String, Vec<MessageGroup>>>>,
    total: u64,
}

impl ErrorTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one error occurrence.
    pub fn add(&mut self, snapshot: &ErrorSnapshot) {
        self.total += 1;

        let source = snapshot.source.clone().unwrap_or_else(|| UNKNOWN.into());
        let code = snapshot.code.clone().unwrap_or_else(|| UNKNOWN.into());
        let groups = self
            .groups
            .entry(source)
            .or_default()
            .entry(code)
            .or_default()
            .entry(snapshot.name.clone())
            .or_default();

        let words: Vec<String> = snapshot
            .message
            .split_whitespace()
            .map(str::to_string)
            .collect();

        for group in groups.iter_mut() {
            if let Some(merged) = merge_word_sequences(&group.words, &words) {
                group.words = merged;
                group.count += 1;
                return;
            }
        }
        groups.push(MessageGroup { words, count: 1 });
    }

    /// Convenience for recording an `anyhow` error directly.
    pub fn add_error(&mut self, err: &anyhow::Error) {
        self.add(&ErrorSnapshot::from_error(err));
    }

    /// Total number of recorded errors.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The `n` highest-count groups, most frequent first.
    #[must_use]
    pub fn most_popular_errors(&self, n: usize) -> Vec<ErrorGroup> {
        let mut leaves = Vec::new();
        for (source, codes) in &self.groups {
            for (code, names) in codes {
                for (name, groups) in names {
                    for group in groups {
                        leaves.push(ErrorGroup {
                            count: group.count,
                            source: source.clone(),
                            code: code.clone(),
                            name: name.clone(),
                            message: group.words.join(" "),
                        });
                    }
                }
            }
        }
        leaves.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.message.cmp(&b.message)));
        leaves.truncate(n);
        leaves
    }

    /// Drop everything recorded so far.
    pub fn reset(&mut self) {
        self.groups.clear();
        self.total = 0;
    }
}

/// Merge two word sequences into a generalized one, or `None` when the
/// result would be more than half placeholders.
fn merge_word_sequences(a: &[String], b: &[String]) -> Option<Vec<String>> {
    let merged = if a.len() == b.len() {
        // Positional merge: fast path for the common case of messages that
        // differ only in a few tokens.
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| {
                if x == y || x == PLACEHOLDER {
                    x.clone()
                } else if y == PLACEHOLDER {
                    y.clone()
                } else {
                    PLACEHOLDER.to_string()
                }
            })
            .collect::<Vec<_>>()
    } else {
        merge_by_common_subsequence(a, b)
    };

    let placeholders = merged.iter().filter(|w| *w == PLACEHOLDER).count();
    if placeholders * 2 > merged.len() {
        None
    } else {
        Some(merged)
    }
}

/// Longest-common-subsequence merge: common words survive in order, each
/// differing stretch collapses to a single placeholder.
fn merge_by_common_subsequence(a: &[String], b: &[String]) -> Vec<String> {
    let n = a.len();
    let m = b.len();
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] || a[i] == PLACEHOLDER || b[j] == PLACEHOLDER {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut merged = Vec::new();
    let mut gap_open = false;
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] || a[i] == PLACEHOLDER || b[j] == PLACEHOLDER {
            let token = if a[i] == PLACEHOLDER || b[j] == PLACEHOLDER {
                PLACEHOLDER.to_string()
            } else {
                a[i].clone()
            };
            if token == PLACEHOLDER {
                if !gap_open {
                    merged.push(token);
                }
                gap_open = true;
            } else {
                merged.push(token);
                gap_open = false;
            }
            i += 1;
            j += 1;
        } else {
            if !gap_open {
                merged.push(PLACEHOLDER.to_string());
                gap_open = true;
            }
            if lcs[i + 1][j] >= lcs[i][j + 1] {
                i += 1;
            } else {
                j += 1;
            }
        }
    }
    if (i < n || j < m) && !gap_open {
        merged.push(PLACEHOLDER.to_string());
    }
    merged
}
