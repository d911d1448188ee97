// packages/subpath-agent/src/control/clients.rs
//! Documents controlled by the agent
//!
//! Configuration changes and forced re-navigation reach loaded pages through
//! a [`ClientNavigator`]. [`ClientRegistry`] is the in-process implementation:
//! it tracks clients as their navigations pass through the agent and emits
//! [`NavigationCommand`]s for the host to execute.

use crate::utils::errors::{AgentError, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// A document under the agent's control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlledClient {
    pub id: String,
    pub url: Url,
}

/// Instruction for the host to (re)load a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationCommand {
    pub client_id: String,
    pub url: Url,
}

/// Enumerates and navigates controlled clients
pub trait ClientNavigator: Send + Sync {
    fn clients(&self) -> Vec<ControlledClient>;

    /// A navigation for `client_id` loaded `url` through the agent
    fn observe(&self, client_id: &str, url: &Url);

    fn navigate<'a>(&'a self, client: &'a ControlledClient, url: &'a Url) -> BoxFuture<'a, Result<()>>;
}

/// Client table backed by a command channel
pub struct ClientRegistry {
    clients: DashMap<String, Url>,
    commands: mpsc::UnboundedSender<NavigationCommand>,
}

impl ClientRegistry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NavigationCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (
            Self {
                clients: DashMap::new(),
                commands,
            },
            receiver,
        )
    }

    /// Record (or update) the document a client is showing
    pub fn claim(&self, client_id: impl Into<String>, url: Url) {
        self.clients.insert(client_id.into(), url);
    }

    pub fn release(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl ClientNavigator for ClientRegistry {
    fn clients(&self) -> Vec<ControlledClient> {
        let mut clients: Vec<ControlledClient> = self
            .clients
            .iter()
            .map(|entry| ControlledClient {
                id: entry.key().clone(),
                url: entry.value().clone(),
            })
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    fn observe(&self, client_id: &str, url: &Url) {
        self.claim(client_id, url.clone());
    }

    fn navigate<'a>(&'a self, client: &'a ControlledClient, url: &'a Url) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            debug!("Navigating client {} to {}", client.id, url);
            self.commands
                .send(NavigationCommand {
                    client_id: client.id.clone(),
                    url: url.clone(),
                })
                .map_err(|_| AgentError::ChannelClosed)
        })
    }
}
