// packages/subpath-agent/src/utils/config.rs
//! Layered settings for the agent and the relay backend
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults (`#[serde(default)]` on every section)
//! 2. `config/subpath-agent.{yaml,toml,json}` or an explicit file
//! 3. `SUBPATH_AGENT__<SECTION>__<KEY>` environment variables

use crate::control::Strategy;
use crate::encoding::probe::{ProbeConfig, DEFAULT_PROBE_PAYLOAD};
use crate::interception::loop_marker::{LoopMarkerKind, DEFAULT_MARKER_PARAM};
use crate::interception::scope::Scope;
use crate::interception::tunnel_codec::TunnelVariant;
use crate::relay::RelayConfig;
use crate::runtime::AgentRuntimeConfig;
use crate::utils::errors::{AgentError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Base name of the optional settings file, resolved relative to the cwd
pub const DEFAULT_CONFIG_BASENAME: &str = "config/subpath-agent";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SUBPATH_AGENT";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub server: ServerSettings,
    pub relay: RelaySettings,
    pub agent: AgentSection,
    pub probe: ProbeSettings,
    pub observability: ObservabilitySettings,
}

/// Relay listener address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7860,
        }
    }
}

/// Relay backend behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Path prefix the relay endpoints live under (must end with `/`)
    pub base_path: String,

    /// Upstream request timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            base_path: "/".to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

/// Interception agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Fully resolved scope, e.g. `/proxy/8080/`
    pub scope: Option<String>,

    /// Scope template containing `{{port}}`, used when `scope` is unset
    pub scope_template: Option<String>,

    /// Port substituted into `scope_template`
    pub target_port: Option<u16>,

    /// URL the agent itself was loaded from
    pub agent_url: String,

    pub loop_marker: LoopMarkerKind,

    /// Reserved query parameter for the query loop marker
    pub marker_param: String,

    pub tunnel_variant: TunnelVariant,

    /// Inject the navigation fixup script into HTML documents
    pub inject_navigation: bool,

    /// `GET_CONFIG` timeout in milliseconds
    pub control_timeout_ms: u64,

    /// Strategy configured once the encoding probe settles
    pub strategy: Strategy,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            scope: None,
            scope_template: None,
            target_port: None,
            agent_url: "http://127.0.0.1:7860/subpath_agent".to_string(),
            loop_marker: LoopMarkerKind::Query,
            marker_param: DEFAULT_MARKER_PARAM.to_string(),
            tunnel_variant: TunnelVariant::Envelope,
            inject_navigation: true,
            control_timeout_ms: 3000,
            strategy: Strategy::Hybrid,
        }
    }
}

/// Encoding probe parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub payload: String,
    pub min_candidate: u32,
    pub max_candidate: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            payload: DEFAULT_PROBE_PAYLOAD.to_string(),
            min_candidate: 4,
            max_candidate: 8,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_format: LogFormat,

    /// Fallback filter when `RUST_LOG` is unset
    pub log_filter: String,

    /// Prometheus exporter listen address; disabled when unset
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_filter: "info".to_string(),
            metrics_addr: None,
        }
    }
}

impl AgentSettings {
    /// Load from the default file location and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from an explicit file (or the default location) and the environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: AgentSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings that cannot produce a working relay or agent
    pub fn validate(&self) -> Result<()> {
        if !self.relay.base_path.starts_with('/') || !self.relay.base_path.ends_with('/') {
            return Err(AgentError::ConfigError(format!(
                "relay.base_path '{}' must start and end with '/'",
                self.relay.base_path
            )));
        }

        if self.probe.min_candidate > self.probe.max_candidate {
            return Err(AgentError::ConfigError(format!(
                "probe.min_candidate ({}) exceeds probe.max_candidate ({})",
                self.probe.min_candidate, self.probe.max_candidate
            )));
        }

        if self.probe.payload.contains('%') {
            return Err(AgentError::ConfigError(
                "probe.payload must not contain '%'".to_string(),
            ));
        }

        if self.agent.marker_param.is_empty() {
            return Err(AgentError::ConfigError(
                "agent.marker_param cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Relay listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| AgentError::ConfigError(format!("Invalid server address: {}", e)))
    }

    /// Resolve the agent scope from `agent.scope` or `agent.scope_template`
    pub fn resolve_scope(&self) -> Result<Scope> {
        if let Some(scope) = &self.agent.scope {
            return Scope::new(scope.as_str());
        }

        match (&self.agent.scope_template, self.agent.target_port) {
            (Some(template), Some(port)) => Scope::from_template(template, port),
            (Some(_), None) => Err(AgentError::ConfigError(
                "agent.scope_template requires agent.target_port".to_string(),
            )),
            _ => Err(AgentError::ConfigError(
                "agent.scope or agent.scope_template must be set".to_string(),
            )),
        }
    }

    pub fn relay_config(&self) -> Result<RelayConfig> {
        Ok(RelayConfig {
            listen_addr: self.listen_addr()?,
            base_path: self.relay.base_path.clone(),
            request_timeout: Duration::from_millis(self.relay.request_timeout_ms),
        })
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            payload: self.probe.payload.clone(),
            min_candidate: self.probe.min_candidate,
            max_candidate: self.probe.max_candidate,
            ..ProbeConfig::default()
        }
    }

    pub fn runtime_config(&self) -> Result<AgentRuntimeConfig> {
        Ok(AgentRuntimeConfig {
            scope: self.resolve_scope()?,
            agent_url: url::Url::parse(&self.agent.agent_url)?,
            loop_marker: self.agent.loop_marker,
            marker_param: self.agent.marker_param.clone(),
            tunnel_variant: self.agent.tunnel_variant,
            inject_navigation: self.agent.inject_navigation,
        })
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.agent.control_timeout_ms)
    }
}
