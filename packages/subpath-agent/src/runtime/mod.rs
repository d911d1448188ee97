// packages/subpath-agent/src/runtime/mod.rs
//! Agent runtime
//!
//! Wires the interception components to the configuration channel:
//!
//! ```text
//!   InterceptedRequest
//!          │
//!          ▼
//! ┌─────────────────┐   snapshot   ┌───────────────┐
//! │  AgentRuntime   │ ◀─────────── │ ConfigChannel │ ◀── ControlRequest
//! │  handle_fetch   │              └───────────────┘
//! └────────┬────────┘
//!          │
//!   ┌──────┼───────────────┬──────────────────┐
//!   ▼      ▼               ▼                  ▼
//! network  PathRewriter   TunnelCodec   NavigationInjector
//! ```

pub mod agent_runtime;

// Re-export commonly used types
pub use agent_runtime::{AgentRuntime, AgentRuntimeConfig};
