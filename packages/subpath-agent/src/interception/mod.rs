// packages/subpath-agent/src/interception/mod.rs
//! Request interception layer
//!
//! Everything the agent does to a single intercepted request:
//!
//! - **Scope**: The deployment prefix and its segment arithmetic
//! - **Request**: Snapshot of the intercepted request
//! - **Loop Marker**: "Already rewritten once" flag (query or in-memory)
//! - **Path Rewriter**: Subpath strategy (prefix restore + encode compensation)
//! - **Tunnel Codec**: Tunnel strategy (envelope to the relay)
//! - **Hybrid**: Per-request choice between the two
//! - **Navigation**: Fixup script injected into HTML documents
//! - **Transport**: The seam every real network hop goes through
//!
//! # Architecture
//!
//! ```text
//! Page fetch
//!     │
//!     ├─ strategy=subpath → Path Rewriter → redirect / forward / passthrough
//!     ├─ strategy=tunnel  → Tunnel Codec  → relay → reconstructed response
//!     ├─ strategy=hybrid  → Hybrid route  → one of the above
//!     └─ navigation       → Transport     → Navigation Injector
//! ```

pub mod hybrid;
pub mod loop_marker;
pub mod navigation;
pub mod path_rewriter;
pub mod request;
pub mod scope;
pub mod transport;
pub mod tunnel_codec;

// Re-export commonly used types
pub use hybrid::{select_route, Route};
pub use loop_marker::{EphemeralSetMarker, LoopMarker, LoopMarkerKind, QueryParamMarker};
pub use navigation::{fix_url, needs_fixup, NavigationInjector};
pub use path_rewriter::{PathRewriter, RewriteDecision};
pub use request::{InterceptedRequest, RequestMode, TransportOptions};
pub use scope::Scope;
pub use transport::{HttpTransport, Transport};
pub use tunnel_codec::{RelayReply, RelayResponse, TunnelCodec, TunnelEnvelope, TunnelVariant};
