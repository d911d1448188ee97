// packages/subpath-agent/src/relay/mod.rs
//! Relay backend
//!
//! Loopback-side counterpart of the agent. It answers the encoding probe and
//! relays tunnelled requests to local ports, bypassing the path handling of
//! the fronting proxy.
//!
//! ```text
//! <base>health                        → "ok"
//! <base>api/test-encoding/<opaque>    → echo of the path as received
//! <base>api/nginx-encoding-test       → probe descriptor
//! <base>api/tunnel            (POST)  → JSON envelope relay
//! <base>api/http-tunnel/<port>?u=...  → streaming path-parameter relay
//! ```

pub mod server;

use std::net::SocketAddr;
use std::time::Duration;

// Re-export commonly used types
pub use server::{RelayBody, RelayServer};

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Path prefix all routes live under; starts and ends with `/`
    pub base_path: String,

    /// Upper bound for one relayed round trip
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7860)),
            base_path: "/".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}
