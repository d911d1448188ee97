// packages/subpath-agent/src/utils/errors.rs
//! Error taxonomy for the interception agent
//!
//! Every variant here is recoverable from the page's point of view: the agent
//! degrades to "proceed as if absent" instead of surfacing these to callers of
//! `AgentRuntime::handle_fetch`.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the agent and the relay backend
#[derive(Error, Debug)]
pub enum AgentError {
    /// Scope did not start and end with `/`
    #[error("Invalid scope '{0}': must start and end with '/'")]
    InvalidScope(String),

    /// No candidate decode depth survived round-trip verification
    #[error("Probe verification failed after {attempts} candidates")]
    ProbeVerificationFailed { attempts: u32 },

    /// Target port could not be derived from the agent path and scope
    #[error("Port extraction failed: {0}")]
    PortExtraction(String),

    /// Relay or upstream unreachable, non-OK, or malformed reply
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Configuration query exceeded its timeout
    #[error("Configuration query timed out after {0:?}")]
    ConfigTimeout(Duration),

    /// Document had neither a head nor an html tag
    #[error("Navigation script injection skipped: {0}")]
    InjectionSkipped(&'static str),

    /// Invalid settings value
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Control channel peer went away
    #[error("Control channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Settings(#[from] config::ConfigError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Http(#[from] hyper::http::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Short, stable label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::InvalidScope(_) => "invalid_scope",
            AgentError::ProbeVerificationFailed { .. } => "probe_verification",
            AgentError::PortExtraction(_) => "port_extraction",
            AgentError::Transport(_) => "transport",
            AgentError::ConfigTimeout(_) => "config_timeout",
            AgentError::InjectionSkipped(_) => "injection_skipped",
            AgentError::ConfigError(_) | AgentError::Settings(_) => "config",
            AgentError::ChannelClosed => "channel_closed",
            AgentError::Json(_) => "json",
            AgentError::Url(_) => "url",
            AgentError::Http(_) => "http",
            AgentError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::ProbeVerificationFailed { attempts: 5 };
        assert_eq!(err.to_string(), "Probe verification failed after 5 candidates");

        let err = AgentError::InvalidScope("proxy/8080".into());
        assert!(err.to_string().contains("proxy/8080"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(AgentError::Transport("x".into()).kind(), "transport");
        assert_eq!(AgentError::ChannelClosed.kind(), "channel_closed");
        assert_eq!(
            AgentError::ConfigTimeout(Duration::from_millis(3000)).kind(),
            "config_timeout"
        );
    }
}
