// packages/subpath-agent/src/observability.rs
//! Logging and metrics setup
//!
//! Counters emitted by the agent:
//!
//! - `subpath_agent_dispatch_total{route}`: per-request dispatch decision
//! - `subpath_agent_tunnel_fallbacks_total`: tunnel failures that fell back
//! - `subpath_agent_probe_failures_total`: probe runs without a verified depth
//! - `subpath_agent_config_changes_total`: effective `CONFIGURE` messages

use crate::utils::config::{LogFormat, ObservabilitySettings};
use crate::utils::errors::{AgentError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured filter.
pub fn init_tracing(settings: &ObservabilitySettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .map_err(|e| AgentError::ConfigError(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match settings.log_format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };

    installed.map_err(|e| AgentError::ConfigError(format!("Tracing already initialized: {}", e)))
}

/// Start the Prometheus exporter if an address is configured
pub fn init_metrics(settings: &ObservabilitySettings) -> Result<Option<SocketAddr>> {
    let Some(addr) = settings.metrics_addr.as_deref() else {
        return Ok(None);
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| AgentError::ConfigError(format!("Invalid metrics address '{}': {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| AgentError::ConfigError(format!("Failed to install metrics exporter: {}", e)))?;

    info!("Metrics exporter listening on {}", addr);
    Ok(Some(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_without_address() {
        let settings = ObservabilitySettings::default();
        assert_eq!(init_metrics(&settings).unwrap(), None);
    }

    #[test]
    fn test_metrics_rejects_bad_address() {
        let settings = ObservabilitySettings {
            metrics_addr: Some("not-an-address".into()),
            ..ObservabilitySettings::default()
        };
        assert!(matches!(init_metrics(&settings), Err(AgentError::ConfigError(_))));
    }
}
