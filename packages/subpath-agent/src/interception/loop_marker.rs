// packages/subpath-agent/src/interception/loop_marker.rs
//! Loop markers
//!
//! A loop marker records that a URL was already produced by a rewrite, so the
//! follow-up request is forwarded instead of being rewritten again. Two
//! interchangeable implementations:
//!
//! - [`QueryParamMarker`]: reserved query parameter, visible on the wire
//! - [`EphemeralSetMarker`]: in-process set, invisible, cleared on first use
//!   or after a short TTL, whichever comes first

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Default reserved query parameter
pub const DEFAULT_MARKER_PARAM: &str = "__subpath_rewritten";

/// How long an unreplayed ephemeral mark stays valid
pub const DEFAULT_EPHEMERAL_TTL: Duration = Duration::from_secs(30);

/// Upper bound on outstanding ephemeral marks
pub const DEFAULT_EPHEMERAL_CAPACITY: usize = 1024;

/// Marker strategy
pub trait LoopMarker: Send + Sync {
    fn is_marked(&self, url: &Url) -> bool;

    /// Mark `url`; already-marked URLs are returned unchanged
    fn mark(&self, url: Url) -> Url;

    /// Remove the mark; the result is never marked
    fn unmark(&self, url: Url) -> Url;
}

/// Which marker implementation to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMarkerKind {
    #[default]
    Query,
    Ephemeral,
}

impl LoopMarkerKind {
    pub fn build(self, param: &str) -> Arc<dyn LoopMarker> {
        match self {
            LoopMarkerKind::Query => Arc::new(QueryParamMarker::new(param)),
            LoopMarkerKind::Ephemeral => Arc::new(EphemeralSetMarker::new()),
        }
    }
}

/// Marks URLs with `?<param>=1`
///
/// Other query pairs are kept byte-for-byte; the query is never re-serialized.
#[derive(Debug, Clone)]
pub struct QueryParamMarker {
    param: String,
}

impl QueryParamMarker {
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
        }
    }

    fn is_marker_pair(&self, pair: &str) -> bool {
        match pair.split_once('=') {
            Some((name, _)) => name == self.param,
            None => pair == self.param,
        }
    }
}

impl Default for QueryParamMarker {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER_PARAM)
    }
}

impl LoopMarker for QueryParamMarker {
    fn is_marked(&self, url: &Url) -> bool {
        url.query()
            .map(|query| query.split('&').any(|pair| self.is_marker_pair(pair)))
            .unwrap_or(false)
    }

    fn mark(&self, mut url: Url) -> Url {
        if self.is_marked(&url) {
            return url;
        }

        let pair = format!("{}=1", self.param);
        let query = match url.query() {
            Some(existing) if !existing.is_empty() => format!("{}&{}", existing, pair),
            _ => pair,
        };
        url.set_query(Some(&query));
        url
    }

    fn unmark(&self, mut url: Url) -> Url {
        let rebuilt = match url.query() {
            Some(query) => query
                .split('&')
                .filter(|pair| !pair.is_empty() && !self.is_marker_pair(pair))
                .collect::<Vec<_>>()
                .join("&"),
            None => return url,
        };

        if rebuilt.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&rebuilt));
        }
        url
    }
}

/// Remembers marked URLs in memory until they are seen once
///
/// A redirect the page never follows leaves its mark behind, so entries also
/// expire after `ttl` and the oldest is evicted once `capacity` is reached.
#[derive(Debug)]
pub struct EphemeralSetMarker {
    marked: DashMap<String, (u64, Instant)>,
    sequence: AtomicU64,
    ttl: Duration,
    capacity: usize,
}

impl EphemeralSetMarker {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_EPHEMERAL_TTL, DEFAULT_EPHEMERAL_CAPACITY)
    }

    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            marked: DashMap::new(),
            sequence: AtomicU64::new(0),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.marked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marked.is_empty()
    }

    fn sweep(&self) {
        let ttl = self.ttl;
        self.marked.retain(|_, (_, marked_at)| marked_at.elapsed() < ttl);

        while self.marked.len() >= self.capacity {
            let oldest = self
                .marked
                .iter()
                .min_by_key(|entry| entry.value().0)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.marked.remove(&key);
                }
                None => break,
            }
        }
    }
}

impl Default for EphemeralSetMarker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopMarker for EphemeralSetMarker {
    fn is_marked(&self, url: &Url) -> bool {
        self.marked
            .get(url.as_str())
            .map(|entry| entry.value().1.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    fn mark(&self, url: Url) -> Url {
        if !self.marked.contains_key(url.as_str()) {
            self.sweep();
        }
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.marked.insert(url.as_str().to_string(), (seq, Instant::now()));
        url
    }

    fn unmark(&self, url: Url) -> Url {
        self.marked.remove(url.as_str());
        url
    }
}
