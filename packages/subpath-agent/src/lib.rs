// packages/subpath-agent/src/lib.rs
//! Subpath Agent
//!
//! Request-interception agent for applications served behind a path-prefixed
//! reverse proxy (`/proxy/<port>/`). It restores the missing prefix on escaping
//! requests, compensates for proxy-side percent-decoding and, when path
//! routing cannot be trusted, tunnels requests to a loopback relay.
//!
//! # Architecture
//!
//! - **encoding**: percent-encoding helpers and the encoding probe
//! - **interception**: scope, loop markers, path rewriter, tunnel codec,
//!   hybrid selector, navigation injector, transport seam
//! - **control**: configuration channel between a controller and the agent
//! - **runtime**: the agent that dispatches intercepted requests
//! - **relay**: loopback HTTP relay and probe echo endpoints
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and errors

// Public module exports
pub mod control;
pub mod encoding;
pub mod interception;
pub mod observability;
pub mod relay;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use control::{ConfigController, ControlMessage, Strategy, StrategyConfig};
pub use encoding::{EncodingProbe, ProbeResult};
pub use interception::{InterceptedRequest, Scope};
pub use relay::{RelayConfig, RelayServer};
pub use runtime::{AgentRuntime, AgentRuntimeConfig};
pub use utils::config::AgentSettings;
pub use utils::errors::{AgentError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
