// packages/subpath-agent/src/control/channel.rs
//! Agent-side configuration state
//!
//! The active [`StrategyConfig`] is swapped as a whole under a write lock.
//! Readers take a copy at dispatch time and never hold the lock across an
//! await point, so an in-flight request keeps the tuple it started with.

use super::clients::ClientNavigator;
use super::messages::{ControlMessage, StrategyConfig};
use metrics::counter;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Result of applying one control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// `CONFIGURE` handled; `reloaded` clients were re-navigated
    Configured { changed: bool, reloaded: usize },
    /// `GET_CONFIG` answer (`None` before the first `CONFIGURE`)
    Config(Option<StrategyConfig>),
    /// `FORCE_NAVIGATE_ALL_CLIENTS` handled
    Navigated(usize),
}

/// Holds the active configuration and reloads clients on change
pub struct ConfigChannel {
    current: RwLock<Option<StrategyConfig>>,
    navigator: Arc<dyn ClientNavigator>,
}

impl ConfigChannel {
    pub fn new(navigator: Arc<dyn ClientNavigator>) -> Self {
        Self {
            current: RwLock::new(None),
            navigator,
        }
    }

    /// Configuration as last set, `None` if never configured
    pub fn current(&self) -> Option<StrategyConfig> {
        *self.current.read()
    }

    /// Configuration to dispatch with; unconfigured behaves as strategy `none`
    pub fn snapshot(&self) -> StrategyConfig {
        self.current().unwrap_or_default()
    }

    /// Record the document a client now shows
    pub fn observe(&self, client_id: &str, url: &Url) {
        self.navigator.observe(client_id, url);
    }

    /// Swap in `config`. Returns false when it equals the active one.
    pub fn replace(&self, config: StrategyConfig) -> bool {
        let mut guard = self.current.write();
        if *guard == Some(config) {
            return false;
        }
        *guard = Some(config);
        true
    }

    pub async fn handle(&self, message: ControlMessage) -> ControlOutcome {
        match message {
            ControlMessage::Configure(config) => {
                if !self.replace(config) {
                    debug!("Configuration unchanged, skipping reload");
                    return ControlOutcome::Configured {
                        changed: false,
                        reloaded: 0,
                    };
                }

                info!(
                    "Configured strategy={} decode_depth={} slash_extra_decoding={}",
                    config.strategy.as_str(),
                    config.decode_depth,
                    config.slash_extra_decoding
                );
                counter!("subpath_agent_config_changes_total").increment(1);

                let reloaded = self.navigate_all().await;
                ControlOutcome::Configured {
                    changed: true,
                    reloaded,
                }
            }
            ControlMessage::GetConfig => ControlOutcome::Config(self.current()),
            ControlMessage::ForceNavigateAllClients => ControlOutcome::Navigated(self.navigate_all().await),
        }
    }

    /// Re-navigate every controlled client to its current URL
    pub async fn navigate_all(&self) -> usize {
        let mut navigated = 0;
        for client in self.navigator.clients() {
            match self.navigator.navigate(&client, &client.url).await {
                Ok(()) => navigated += 1,
                Err(e) => warn!("Failed to navigate client {}: {}", client.id, e),
            }
        }
        navigated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::clients::ClientRegistry;
    use crate::control::messages::Strategy;
    use url::Url;

    fn channel_with_clients(n: usize) -> (ConfigChannel, tokio::sync::mpsc::UnboundedReceiver<crate::control::NavigationCommand>) {
        let (registry, rx) = ClientRegistry::new();
        for i in 0..n {
            registry.claim(
                format!("client-{i}"),
                Url::parse(&format!("https://host/proxy/8080/page{i}")).unwrap(),
            );
        }
        (ConfigChannel::new(Arc::new(registry)), rx)
    }

    #[test]
    fn test_unconfigured_snapshot_is_none_strategy() {
        let (channel, _rx) = channel_with_clients(0);
        assert_eq!(channel.current(), None);
        assert_eq!(channel.snapshot().strategy, Strategy::None);
    }

    #[tokio::test]
    async fn test_identical_configure_reloads_once() {
        let (channel, mut rx) = channel_with_clients(2);
        let config = StrategyConfig {
            strategy: Strategy::Subpath,
            decode_depth: 1,
            slash_extra_decoding: false,
        };

        let first = channel.handle(ControlMessage::Configure(config)).await;
        let second = channel.handle(ControlMessage::Configure(config)).await;

        assert_eq!(first, ControlOutcome::Configured { changed: true, reloaded: 2 });
        assert_eq!(second, ControlOutcome::Configured { changed: false, reloaded: 0 });

        let mut commands = 0;
        while rx.try_recv().is_ok() {
            commands += 1;
        }
        assert_eq!(commands, 2);
    }

    #[tokio::test]
    async fn test_get_config_reflects_configure() {
        let (channel, _rx) = channel_with_clients(0);
        assert_eq!(channel.handle(ControlMessage::GetConfig).await, ControlOutcome::Config(None));

        let config = StrategyConfig::new(Strategy::Tunnel);
        channel.handle(ControlMessage::Configure(config)).await;
        assert_eq!(
            channel.handle(ControlMessage::GetConfig).await,
            ControlOutcome::Config(Some(config))
        );
    }

    #[tokio::test]
    async fn test_force_navigate_counts_failures_out() {
        let (channel, rx) = channel_with_clients(3);
        drop(rx);
        assert_eq!(
            channel.handle(ControlMessage::ForceNavigateAllClients).await,
            ControlOutcome::Navigated(0)
        );
    }
}
