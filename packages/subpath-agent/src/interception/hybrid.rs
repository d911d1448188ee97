// packages/subpath-agent/src/interception/hybrid.rs
//! Hybrid strategy routing
//!
//! Encoded separators are the one thing prefix correction cannot fix when the
//! proxy un-escapes `%2F`; those go through the tunnel, everything else through
//! the path rewriter.

use crate::encoding::contains_encoded_slash;

/// Handler chosen for a request under the hybrid strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Subpath,
    Tunnel,
}

/// Pure per-request routing
pub fn select_route(path: &str, slash_extra_decoding: bool) -> Route {
    if slash_extra_decoding && contains_encoded_slash(path) {
        Route::Tunnel
    } else {
        Route::Subpath
    }
}
