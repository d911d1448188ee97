// packages/subpath-agent/src/interception/tunnel_codec.rs
//! Tunnel strategy: relay requests straight to the local port
//!
//! When a path cannot be reliably prefix-corrected (encoded separators the
//! proxy mangles), the request is packed into a JSON envelope and handed to the
//! relay, which performs it against `http://localhost:<port>` directly.
//!
//! ```text
//! page ── fetch /api/data%2Ffile ──► agent
//!                                     │ TunnelEnvelope (JSON)
//!                                     ▼
//!                        POST <relay>/api/tunnel ──► http://localhost:8080/api/data%2Ffile
//!                                     │ RelayReply (JSON)
//!                                     ▼
//!                              reconstructed response
//! ```

use crate::encoding::has_percent_encoding;
use crate::interception::path_rewriter::complete_prefix;
use crate::interception::request::InterceptedRequest;
use crate::interception::scope::{split_segments, Scope};
use crate::utils::errors::{AgentError, Result};
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use url::Url;

/// JSON envelope endpoint relative to the relay base
pub const ENVELOPE_ENDPOINT: &str = "api/tunnel";

/// Path-parameter endpoint prefix relative to the relay base
pub const PATH_TUNNEL_ENDPOINT: &str = "api/http-tunnel/";

/// Query parameter carrying the encoded remainder in the path-parameter variant
pub const REMAINDER_PARAM: &str = "u";

/// Header the relay sets on responses describing its own failures
pub const RELAY_ERROR_HEADER: &str = "x-subpath-relay-error";

/// Headers that never cross a hop
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Which relay protocol to speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelVariant {
    /// `POST api/tunnel` with a JSON envelope
    #[default]
    Envelope,

    /// `api/http-tunnel/<port>?u=<remainder>`
    PathParameter,
}

/// JSON-safe projection of an intercepted request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelEnvelope {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// Successful relay reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub status: u16,
    #[serde(rename = "statusText", default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Vec<u8>>,
}

/// Relay reply: a packed response or an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayReply {
    Response(RelayResponse),
    Failure { error: String },
}

/// Packs requests for the relay and unpacks its replies
pub struct TunnelCodec {
    scope: Scope,
    port: Option<u16>,
    relay_base: Url,
}

impl TunnelCodec {
    /// `agent_url` is the URL the agent was loaded from; its directory is the relay base
    pub fn new(scope: Scope, agent_url: &Url) -> Self {
        let port = match scope.target_port(agent_url.path()) {
            Ok(port) => Some(port),
            Err(e) => {
                warn!("Tunnel disabled: {}", e);
                None
            }
        };

        let mut relay_base = agent_url.clone();
        relay_base.set_query(None);
        relay_base.set_fragment(None);
        if let Some(idx) = relay_base.path().rfind('/') {
            let directory = relay_base.path()[..=idx].to_string();
            relay_base.set_path(&directory);
        }

        Self {
            scope,
            port,
            relay_base,
        }
    }

    /// Target port, if it could be extracted
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn relay_base(&self) -> &Url {
        &self.relay_base
    }

    pub fn envelope_endpoint(&self) -> Result<Url> {
        Ok(self.relay_base.join(ENVELOPE_ENDPOINT)?)
    }

    /// True if `url` is itself addressed to the relay
    pub fn is_tunnel_call(&self, url: &Url) -> bool {
        if url.origin() != self.relay_base.origin() {
            return false;
        }

        let base = self.relay_base.path();
        match url.path().strip_prefix(base) {
            Some(rest) => rest == ENVELOPE_ENDPOINT || rest.starts_with(PATH_TUNNEL_ENDPOINT),
            None => false,
        }
    }

    /// Trigger condition for tunnelling
    ///
    /// Same-origin, not a relay call, not a navigation, and the path either
    /// escapes the scope or carries percent-encoded characters.
    pub fn should_tunnel(&self, request: &InterceptedRequest, origin: &Url) -> bool {
        if self.port.is_none()
            || !request.is_same_origin(origin)
            || request.is_navigation()
            || self.is_tunnel_call(&request.url)
        {
            return false;
        }

        let path = request.url.path();
        let segments = split_segments(path);
        self.scope.common_prefix_len(&segments) < self.scope.segments().len()
            || has_percent_encoding(path)
    }

    /// Path after the scope, always starting with one `/`
    pub fn remainder(&self, path: &str) -> String {
        let completed = complete_prefix(&self.scope, path);
        match completed.strip_prefix(self.scope.as_str()) {
            Some(rest) => format!("/{}", rest),
            None => "/".to_string(),
        }
    }

    /// Remainder plus the original query
    pub fn remainder_with_query(&self, url: &Url) -> String {
        let remainder = self.remainder(url.path());
        match url.query() {
            Some(query) => format!("{}?{}", remainder, query),
            None => remainder,
        }
    }

    /// `http://localhost:<port><remainder><query>`
    pub fn target_url(&self, url: &Url) -> Result<String> {
        let port = self.require_port()?;
        Ok(format!("http://localhost:{}{}", port, self.remainder_with_query(url)))
    }

    /// Build the envelope for `request`
    pub fn encode(&self, request: &InterceptedRequest) -> Result<TunnelEnvelope> {
        let body = if request.carries_body() {
            Some(request.body.as_ref().map(|b| b.to_vec()).unwrap_or_default())
        } else {
            None
        };

        Ok(TunnelEnvelope {
            method: request.method.to_string(),
            url: self.target_url(&request.url)?,
            headers: flatten_headers(&request.headers),
            body,
        })
    }

    /// The request that carries `request` to the JSON relay
    pub fn envelope_request(&self, request: &InterceptedRequest) -> Result<InterceptedRequest> {
        let envelope = self.encode(request)?;
        let body = serde_json::to_vec(&envelope)?;
        debug!("Tunnelling {} {} via envelope", envelope.method, envelope.url);

        Ok(InterceptedRequest::new(Method::POST, self.envelope_endpoint()?)
            .with_header(CONTENT_TYPE.as_str(), "application/json")
            .with_body(body))
    }

    /// `<relay>/api/http-tunnel/<port>?u=<encoded remainder+query>`
    pub fn path_parameter_url(&self, url: &Url) -> Result<Url> {
        let port = self.require_port()?;
        let mut target = self
            .relay_base
            .join(&format!("{}{}", PATH_TUNNEL_ENDPOINT, port))?;

        let encoded = urlencoding::encode(&self.remainder_with_query(url)).into_owned();
        target.set_query(Some(&format!("{}={}", REMAINDER_PARAM, encoded)));
        Ok(target)
    }

    /// The request that carries `request` through the path-parameter relay
    pub fn path_parameter_request(&self, request: &InterceptedRequest) -> Result<InterceptedRequest> {
        let target = self.path_parameter_url(&request.url)?;
        debug!("Tunnelling {} {} via {}", request.method, request.url, target);

        let mut relayed = request.with_url(target);
        relayed.mode = Default::default();
        Ok(relayed)
    }

    /// Rebuild a response from a relay reply body
    pub fn decode_reply(body: &[u8]) -> Result<Response<Bytes>> {
        match serde_json::from_slice::<RelayReply>(body)? {
            RelayReply::Failure { error } => Err(AgentError::Transport(format!("Relay error: {}", error))),
            RelayReply::Response(reply) => reply.into_response(),
        }
    }

    fn require_port(&self) -> Result<u16> {
        self.port.ok_or_else(|| {
            AgentError::PortExtraction(format!("no target port for scope '{}'", self.scope))
        })
    }
}

impl RelayResponse {
    /// Convert to a response, dropping headers that no longer describe the body
    pub fn into_response(self) -> Result<Response<Bytes>> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|_| AgentError::Transport(format!("Invalid relay status {}", self.status)))?;

        let mut builder = Response::builder().status(status);
        for (name, value) in &self.headers {
            let lower = name.to_ascii_lowercase();
            if is_hop_by_hop(&lower) || lower == "content-length" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }

        Ok(builder.body(Bytes::from(self.body.unwrap_or_default()))?)
    }
}

/// Headers as a flat map; repeated headers are joined with `, `
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        flat.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    flat
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn codec() -> TunnelCodec {
        TunnelCodec::new(
            Scope::new("/proxy/8080/").unwrap(),
            &url("https://host/proxy/7860/subpath_agent"),
        )
    }

    fn origin() -> Url {
        url("https://host/")
    }

    #[test]
    fn test_port_and_relay_base() {
        let codec = codec();
        assert_eq!(codec.port(), Some(8080));
        assert_eq!(codec.relay_base().as_str(), "https://host/proxy/7860/");
        assert_eq!(
            codec.envelope_endpoint().unwrap().as_str(),
            "https://host/proxy/7860/api/tunnel"
        );
    }

    #[test]
    fn test_envelope_for_encoded_separator() {
        let codec = codec();
        let req = InterceptedRequest::get(url("https://host/proxy/8080/api/data%2Ffile"));

        assert!(codec.should_tunnel(&req, &origin()));
        let envelope = codec.encode(&req).unwrap();
        assert_eq!(envelope.url, "http://localhost:8080/api/data%2Ffile");
        assert_eq!(envelope.method, "GET");
        assert!(envelope.body.is_none());
    }

    #[test]
    fn test_envelope_completes_prefix_and_keeps_query() {
        let codec = codec();
        let req = InterceptedRequest::new(Method::POST, url("https://host/api/items?page=2"))
            .with_header("content-type", "application/json")
            .with_header("x-multi", "a")
            .with_header("x-multi", "b")
            .with_body(r#"{"a":1}"#);

        let envelope = codec.encode(&req).unwrap();
        assert_eq!(envelope.url, "http://localhost:8080/api/items?page=2");
        assert_eq!(envelope.body.as_deref(), Some(&br#"{"a":1}"#[..]));
        assert_eq!(envelope.headers.get("x-multi").unwrap(), "a, b");
        assert_eq!(envelope.headers.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn test_remainder() {
        let codec = codec();
        assert_eq!(codec.remainder("/proxy/8080/"), "/");
        assert_eq!(codec.remainder("/proxy/8080"), "/");
        assert_eq!(codec.remainder("/"), "/");
        assert_eq!(codec.remainder("/proxy/8080/a/b"), "/a/b");
    }

    #[test]
    fn test_trigger_conditions() {
        let codec = codec();
        let inside = InterceptedRequest::get(url("https://host/proxy/8080/api/data"));
        assert!(!codec.should_tunnel(&inside, &origin()));

        let escaped = InterceptedRequest::get(url("https://host/api/data"));
        assert!(codec.should_tunnel(&escaped, &origin()));

        let navigation = InterceptedRequest::navigate(url("https://host/api/data"));
        assert!(!codec.should_tunnel(&navigation, &origin()));

        let cross_origin = InterceptedRequest::get(url("https://cdn.example/api/data"));
        assert!(!codec.should_tunnel(&cross_origin, &origin()));

        let relay_call = InterceptedRequest::get(url("https://host/proxy/7860/api/tunnel"));
        assert!(codec.is_tunnel_call(&relay_call.url));
        assert!(!codec.should_tunnel(&relay_call, &origin()));

        let path_relay = url("https://host/proxy/7860/api/http-tunnel/8080?u=%2F");
        assert!(codec.is_tunnel_call(&path_relay));
    }

    #[test]
    fn test_no_port_never_tunnels() {
        let codec = TunnelCodec::new(
            Scope::new("/proxy/8080/").unwrap(),
            &url("https://host/proxy/8080/subpath_agent"),
        );
        assert_eq!(codec.port(), None);

        let req = InterceptedRequest::get(url("https://host/api/data%2Ffile"));
        assert!(!codec.should_tunnel(&req, &origin()));
        assert!(matches!(codec.encode(&req), Err(AgentError::PortExtraction(_))));
    }

    #[test]
    fn test_path_parameter_url() {
        let codec = codec();
        let target = codec
            .path_parameter_url(&url("https://host/proxy/8080/api/data%2Ffile?x=1"))
            .unwrap();
        assert_eq!(
            target.as_str(),
            "https://host/proxy/7860/api/http-tunnel/8080?u=%2Fapi%2Fdata%252Ffile%3Fx%3D1"
        );
    }

    #[test]
    fn test_decode_reply() {
        let body = br#"{"status":201,"statusText":"Created","headers":{"content-type":"text/plain","connection":"close","content-length":"2"},"body":[111,107]}"#;
        let response = TunnelCodec::decode_reply(body).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert!(response.headers().get("connection").is_none());
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(response.body().as_ref(), b"ok");
    }

    #[test]
    fn test_decode_reply_failures() {
        assert!(matches!(
            TunnelCodec::decode_reply(br#"{"error":"connection refused"}"#),
            Err(AgentError::Transport(_))
        ));
        assert!(TunnelCodec::decode_reply(b"not json").is_err());
        assert!(TunnelCodec::decode_reply(br#"{"status":1000}"#).is_err());
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = TunnelEnvelope {
            method: "PUT".into(),
            url: "http://localhost:8080/x".into(),
            headers: BTreeMap::new(),
            body: Some(vec![1, 2]),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["body"], serde_json::json!([1, 2]));
        assert_eq!(json["method"], "PUT");
    }
}
