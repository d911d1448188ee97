// packages/subpath-agent/src/control/controller.rs
//! Controller side of the configuration channel
//!
//! Queries are correlated by a ULID request id. Each outstanding query is a
//! [`PendingOperation`] resolved by the reply pump; a query that outlives the
//! timeout, or whose channel closes, resolves to the "no config" sentinel.

use super::messages::{ConfigReply, ControlMessage, ControlRequest, Strategy, StrategyConfig};
use crate::encoding::EncodingProbe;
use crate::utils::errors::{AgentError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use ulid::Ulid;

/// Default wait for a `GET_CONFIG` reply
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(3000);

/// An unanswered `GET_CONFIG`
struct PendingOperation {
    resolver: oneshot::Sender<Option<StrategyConfig>>,
    created_at: Instant,
}

/// Sends control messages to an agent and awaits query replies
pub struct ConfigController {
    requests: mpsc::Sender<ControlRequest>,
    pending: Arc<DashMap<String, PendingOperation>>,
    timeout: Duration,
    pump: JoinHandle<()>,
}

impl ConfigController {
    pub fn new(
        requests: mpsc::Sender<ControlRequest>,
        mut replies: mpsc::Receiver<ConfigReply>,
        timeout: Duration,
    ) -> Self {
        let pending: Arc<DashMap<String, PendingOperation>> = Arc::new(DashMap::new());

        let pump_pending = Arc::clone(&pending);
        let pump = tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                let Some(id) = reply.id else {
                    debug!("Dropping uncorrelated config reply");
                    continue;
                };
                match pump_pending.remove(&id) {
                    Some((_, operation)) => {
                        debug!(
                            "Config reply {} after {:?}",
                            id,
                            operation.created_at.elapsed()
                        );
                        let _ = operation.resolver.send(reply.config);
                    }
                    None => debug!("Late config reply {}", id),
                }
            }
        });

        Self {
            requests,
            pending,
            timeout,
            pump,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn configure(&self, config: StrategyConfig) -> Result<()> {
        self.send(ControlRequest::new(ControlMessage::Configure(config))).await
    }

    /// Probe the proxy, then configure `strategy` with the measured parameters
    pub async fn configure_probed(&self, strategy: Strategy, probe: &EncodingProbe) -> Result<StrategyConfig> {
        let result = probe.result().await;
        let config = StrategyConfig::from_probe(strategy, &result);
        self.configure(config).await?;
        Ok(config)
    }

    pub async fn force_navigate_all(&self) -> Result<()> {
        self.send(ControlRequest::new(ControlMessage::ForceNavigateAllClients))
            .await
    }

    /// Current agent configuration, `None` when unconfigured or unreachable
    pub async fn get_config(&self) -> Option<StrategyConfig> {
        match self.query().await {
            Ok(config) => config,
            Err(e) => {
                debug!("GET_CONFIG resolved to no config: {}", e);
                None
            }
        }
    }

    /// `GET_CONFIG` with the failure reason preserved
    pub async fn query(&self) -> Result<Option<StrategyConfig>> {
        let id = Ulid::new().to_string();
        let (resolver, receiver) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingOperation {
                resolver,
                created_at: Instant::now(),
            },
        );

        if let Err(e) = self
            .send(ControlRequest::with_id(id.clone(), ControlMessage::GetConfig))
            .await
        {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(config)) => Ok(config),
            Ok(Err(_)) => Err(AgentError::ChannelClosed),
            Err(_) => {
                self.pending.remove(&id);
                Err(AgentError::ConfigTimeout(self.timeout))
            }
        }
    }

    async fn send(&self, request: ControlRequest) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| AgentError::ChannelClosed)
    }
}

impl Drop for ConfigController {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal responder that answers queries from a fixed value
    fn spawn_responder(
        config: Option<StrategyConfig>,
    ) -> (mpsc::Sender<ControlRequest>, mpsc::Receiver<ConfigReply>) {
        let (req_tx, mut req_rx) = mpsc::channel::<ControlRequest>(8);
        let (rep_tx, rep_rx) = mpsc::channel::<ConfigReply>(8);
        tokio::spawn(async move {
            while let Some(request) = req_rx.recv().await {
                if request.message == ControlMessage::GetConfig {
                    let _ = rep_tx
                        .send(ConfigReply {
                            id: request.id,
                            config,
                        })
                        .await;
                }
            }
        });
        (req_tx, rep_rx)
    }

    #[tokio::test]
    async fn test_query_resolves_reply() {
        let config = StrategyConfig::new(Strategy::Hybrid);
        let (tx, rx) = spawn_responder(Some(config));
        let controller = ConfigController::new(tx, rx, DEFAULT_CONTROL_TIMEOUT);

        assert_eq!(controller.get_config().await, Some(config));
        assert_eq!(controller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_config_resolves_quickly() {
        let (tx, rx) = spawn_responder(None);
        let controller = ConfigController::new(tx, rx, DEFAULT_CONTROL_TIMEOUT);

        let started = Instant::now();
        assert_eq!(controller.query().await.unwrap(), None);
        assert!(started.elapsed() < DEFAULT_CONTROL_TIMEOUT);
    }

    #[tokio::test]
    async fn test_silent_agent_times_out_to_sentinel() {
        let (tx, mut silent_rx) = mpsc::channel::<ControlRequest>(8);
        let (_rep_tx, rep_rx) = mpsc::channel::<ConfigReply>(8);
        tokio::spawn(async move { while silent_rx.recv().await.is_some() {} });

        let controller = ConfigController::new(tx, rep_rx, Duration::from_millis(50));
        assert!(matches!(
            controller.query().await,
            Err(AgentError::ConfigTimeout(_))
        ));
        assert_eq!(controller.get_config().await, None);
        assert_eq!(controller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_resolves_to_sentinel() {
        let (tx, req_rx) = mpsc::channel::<ControlRequest>(1);
        let (_rep_tx, rep_rx) = mpsc::channel::<ConfigReply>(1);
        drop(req_rx);

        let controller = ConfigController::new(tx, rep_rx, DEFAULT_CONTROL_TIMEOUT);
        assert_eq!(controller.get_config().await, None);
        assert!(matches!(
            controller.configure(StrategyConfig::default()).await,
            Err(AgentError::ChannelClosed)
        ));
    }
}
