// packages/subpath-agent/src/utils/mod.rs
//! Common utilities shared by every layer of the agent
//!
//! - **errors**: Crate-wide error type and `Result` alias
//! - **config**: Layered settings (file + environment)

pub mod config;
pub mod errors;

pub use config::AgentSettings;
pub use errors::{AgentError, Result};
