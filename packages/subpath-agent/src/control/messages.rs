// packages/subpath-agent/src/control/messages.rs
//! Control protocol messages
//!
//! Wire form (JSON):
//!
//! ```text
//! {"type": "CONFIGURE", "data": {"strategy": "hybrid", "decodeDepth": 2, "slashExtraDecoding": true}}
//! {"type": "GET_CONFIG"}
//! {"type": "FORCE_NAVIGATE_ALL_CLIENTS"}
//! ```

use crate::encoding::ProbeResult;
use serde::{Deserialize, Serialize};

/// Rewrite mechanism applied to intercepted requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    None,
    Subpath,
    Tunnel,
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::None => "none",
            Strategy::Subpath => "subpath",
            Strategy::Tunnel => "tunnel",
            Strategy::Hybrid => "hybrid",
        }
    }
}

/// Strategy plus probe parameters, replaced as one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    pub strategy: Strategy,
    #[serde(default)]
    pub decode_depth: u32,
    #[serde(default)]
    pub slash_extra_decoding: bool,
}

impl StrategyConfig {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Combine a strategy with probed proxy behaviour
    pub fn from_probe(strategy: Strategy, probe: &ProbeResult) -> Self {
        Self {
            strategy,
            decode_depth: probe.decode_depth,
            slash_extra_decoding: probe.slash_extra_decoding,
        }
    }
}

/// Message from a controller to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    Configure(StrategyConfig),
    GetConfig,
    ForceNavigateAllClients,
}

/// A control message plus its correlation id (set for queries)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub id: Option<String>,
    pub message: ControlMessage,
}

impl ControlRequest {
    pub fn new(message: ControlMessage) -> Self {
        Self { id: None, message }
    }

    pub fn with_id(id: impl Into<String>, message: ControlMessage) -> Self {
        Self {
            id: Some(id.into()),
            message,
        }
    }
}

/// Reply to `GET_CONFIG`; `config: null` is the "no config" sentinel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub config: Option<StrategyConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_configure_wire_format() {
        let message: ControlMessage = serde_json::from_value(json!({
            "type": "CONFIGURE",
            "data": {"strategy": "hybrid", "decodeDepth": 2, "slashExtraDecoding": true}
        }))
        .unwrap();

        assert_eq!(
            message,
            ControlMessage::Configure(StrategyConfig {
                strategy: Strategy::Hybrid,
                decode_depth: 2,
                slash_extra_decoding: true,
            })
        );
    }

    #[test]
    fn test_unit_messages_wire_format() {
        let get: ControlMessage = serde_json::from_value(json!({"type": "GET_CONFIG"})).unwrap();
        assert_eq!(get, ControlMessage::GetConfig);

        let nav: ControlMessage =
            serde_json::from_value(json!({"type": "FORCE_NAVIGATE_ALL_CLIENTS"})).unwrap();
        assert_eq!(nav, ControlMessage::ForceNavigateAllClients);

        assert_eq!(
            serde_json::to_value(ControlMessage::GetConfig).unwrap(),
            json!({"type": "GET_CONFIG"})
        );
    }

    #[test]
    fn test_unknown_message_rejected() {
        assert!(serde_json::from_value::<ControlMessage>(json!({"type": "RESET"})).is_err());
        assert!(serde_json::from_value::<ControlMessage>(json!({
            "type": "CONFIGURE",
            "data": {"strategy": "bogus"}
        }))
        .is_err());
    }

    #[test]
    fn test_missing_probe_fields_default() {
        let config: StrategyConfig = serde_json::from_value(json!({"strategy": "subpath"})).unwrap();
        assert_eq!(config, StrategyConfig::new(Strategy::Subpath));
    }

    #[test]
    fn test_from_probe() {
        let probe = ProbeResult {
            decode_depth: 3,
            slash_extra_decoding: true,
        };
        let config = StrategyConfig::from_probe(Strategy::Hybrid, &probe);
        assert_eq!(config.decode_depth, 3);
        assert!(config.slash_extra_decoding);
        assert_eq!(config.strategy.as_str(), "hybrid");
    }

    #[test]
    fn test_reply_sentinel() {
        let reply = ConfigReply { id: None, config: None };
        assert_eq!(serde_json::to_value(&reply).unwrap(), json!({"config": null}));
    }
}
