// packages/subpath-agent/src/main.rs
//! Subpath Agent host
//!
//! Serves the loopback relay and probe endpoints, runs an interception agent
//! for the configured scope and configures it from the detected proxy
//! encoding behaviour once the probe settles.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use subpath_agent::control::ClientRegistry;
use subpath_agent::encoding::EncodingProbe;
use subpath_agent::interception::HttpTransport;
use subpath_agent::observability::{init_metrics, init_tracing};
use subpath_agent::relay::RelayServer;
use subpath_agent::runtime::AgentRuntime;
use subpath_agent::utils::config::AgentSettings;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional explicit config file as the only argument
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = AgentSettings::load_from(config_path.as_deref()).context("Failed to load configuration")?;

    init_tracing(&settings.observability)?;
    init_metrics(&settings.observability)?;

    info!("Starting Subpath Agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {:?}", settings);

    let relay_config = settings.relay_config()?;
    let relay = Arc::new(RelayServer::new(relay_config.clone()));
    let listener = relay.bind().await.context("Failed to bind relay listener")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, cleaning up..."),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    match settings.runtime_config() {
        Ok(runtime_config) => {
            let transport = Arc::new(
                HttpTransport::new(relay_config.request_timeout).context("Failed to build HTTP transport")?,
            );
            let (registry, mut commands) = ClientRegistry::new();

            // Probe through the public agent URL so the fronting proxy is measured
            let probe_base = runtime_config
                .agent_url
                .join("./")
                .context("Invalid agent URL")?;
            let probe = EncodingProbe::new(transport.clone(), probe_base, settings.probe_config());

            let runtime = Arc::new(AgentRuntime::new(runtime_config, transport, Arc::new(registry)));
            let (controller, _control_task) = runtime.spawn_control(settings.control_timeout());
            let strategy = settings.agent.strategy;
            let agent_token = shutdown.clone();

            tokio::spawn(async move {
                while let Some(command) = commands.recv().await {
                    info!("Reload requested for client {}: {}", command.client_id, command.url);
                }
            });

            tokio::spawn(async move {
                match controller.configure_probed(strategy, &probe).await {
                    Ok(config) => info!(
                        "Agent configured: strategy={} decode_depth={} slash_extra_decoding={}",
                        config.strategy.as_str(),
                        config.decode_depth,
                        config.slash_extra_decoding
                    ),
                    Err(e) => warn!("Failed to configure agent: {}", e),
                }
                // The controller owns the reply pump; hold it until shutdown
                agent_token.cancelled().await;
                drop(controller);
            });
        }
        Err(e) => warn!("Interception agent disabled: {}", e),
    }

    match relay.serve(listener, shutdown).await {
        Ok(()) => {
            info!("Relay stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Relay error: {}", e);
            Err(e.into())
        }
    }
}
