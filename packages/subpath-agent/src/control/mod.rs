// packages/subpath-agent/src/control/mod.rs
//! Configuration channel
//!
//! ```text
//! ┌──────────────────┐  ControlRequest   ┌───────────────┐
//! │ ConfigController │ ────────────────▶ │ AgentRuntime  │
//! │  (pending ops)   │ ◀──────────────── │ ConfigChannel │──▶ ClientNavigator
//! └──────────────────┘    ConfigReply    └───────────────┘
//! ```

pub mod channel;
pub mod clients;
pub mod controller;
pub mod messages;

// Re-export commonly used types
pub use channel::{ConfigChannel, ControlOutcome};
pub use clients::{ClientNavigator, ClientRegistry, ControlledClient, NavigationCommand};
pub use controller::{ConfigController, DEFAULT_CONTROL_TIMEOUT};
pub use messages::{ConfigReply, ControlMessage, ControlRequest, Strategy, StrategyConfig};
