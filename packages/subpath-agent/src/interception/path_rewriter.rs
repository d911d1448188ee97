// packages/subpath-agent/src/interception/path_rewriter.rs
//! Subpath strategy: restore the missing deployment prefix
//!
//! Pages behind a path-prefixed proxy often request root-relative URLs
//! (`/api/data`) that escape the prefix (`/proxy/8080/`). The rewriter
//! redirects those to the prefixed URL and, when the proxy decodes paths,
//! pre-encodes escaped segments so they arrive intact.
//!
//! # Decision order
//!
//! ```text
//! scope == "/"          → Passthrough
//! marked                → Forward(unmarked)        (terminal)
//! re-encode / re-prefix → Redirect(marked)
//! otherwise             → Passthrough
//! ```

use crate::encoding::{encode_times, has_percent_encoding};
use crate::interception::loop_marker::LoopMarker;
use crate::interception::scope::Scope;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Outcome for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteDecision {
    /// Leave the request alone
    Passthrough,

    /// Already rewritten once; send the clean URL to the network
    Forward(Url),

    /// Redirect the client to the corrected, marked URL
    Redirect(Url),
}

/// Prefix-restoring path rewriter
pub struct PathRewriter {
    scope: Scope,
    marker: Arc<dyn LoopMarker>,
}

impl PathRewriter {
    pub fn new(scope: Scope, marker: Arc<dyn LoopMarker>) -> Self {
        Self { scope, marker }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn marker(&self) -> &Arc<dyn LoopMarker> {
        &self.marker
    }

    /// Decide what to do with a same-origin request
    pub fn decide(&self, url: &Url, decode_depth: u32) -> RewriteDecision {
        if self.scope.is_root() {
            return RewriteDecision::Passthrough;
        }

        if self.marker.is_marked(url) {
            let clean = self.marker.unmark(url.clone());
            debug!("Forwarding previously rewritten request: {}", clean);
            return RewriteDecision::Forward(clean);
        }

        match corrected_path(&self.scope, url.path(), decode_depth) {
            Some(path) => {
                let mut target = url.clone();
                target.set_path(&path);
                debug!("Rewriting {} -> {}", url.path(), path);
                RewriteDecision::Redirect(self.marker.mark(target))
            }
            None => RewriteDecision::Passthrough,
        }
    }
}

/// Corrected path, or `None` if `path` needs no change
pub fn corrected_path(scope: &Scope, path: &str, decode_depth: u32) -> Option<String> {
    let mut parts = path_parts(path);
    let common = scope.common_prefix_len(&parts);
    let mut changed = false;

    if decode_depth > 0 {
        for part in parts.iter_mut() {
            if has_percent_encoding(part) {
                *part = encode_times(part, decode_depth);
                changed = true;
            }
        }
    }

    if common < scope.segments().len() {
        parts = prefixed_parts(scope, parts, common);
        changed = true;
    }

    changed.then(|| join_parts(&parts))
}

/// Replace a missing or partial prefix with the full scope, without re-encoding
pub fn complete_prefix(scope: &Scope, path: &str) -> String {
    let parts = path_parts(path);
    let common = scope.common_prefix_len(&parts);

    if common < scope.segments().len() {
        join_parts(&prefixed_parts(scope, parts, common))
    } else {
        path.to_string()
    }
}

/// Raw parts after the leading slash; a trailing slash yields a final empty part
fn path_parts(path: &str) -> Vec<String> {
    path.strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .map(str::to_string)
        .collect()
}

fn prefixed_parts(scope: &Scope, parts: Vec<String>, common: usize) -> Vec<String> {
    let mut rest: Vec<String> = parts.into_iter().skip(common).collect();
    if rest.is_empty() {
        rest.push(String::new());
    }

    scope.segments().iter().cloned().chain(rest).collect()
}

fn join_parts(parts: &[String]) -> String {
    format!("/{}", parts.join("/"))
}
