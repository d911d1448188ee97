// packages/subpath-agent/src/encoding/probe.rs
//! Proxy encoding probe
//!
//! Determines how many extra percent-encoding layers a path segment must carry
//! to survive the proxy, and whether the proxy un-escapes `%2F` into a real
//! separator. Talks to an echo endpoint:
//!
//! ```text
//! GET <base>/api/test-encoding/<opaque>  →  {"path": "<opaque as received>"}
//! ```
//!
//! A candidate depth is only accepted after a second, independent round trip
//! returns the single-encoded baseline byte-for-byte. Anything else falls back
//! to depth 0.

use crate::encoding::{encode_component, encode_times};
use crate::interception::request::InterceptedRequest;
use crate::interception::scope::split_segments;
use crate::interception::transport::Transport;
use crate::utils::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

/// Plain probe payload: non-ASCII plus a space, never `%`
pub const DEFAULT_PROBE_PAYLOAD: &str = "中文 probe";

/// Payload used for the separator probe (encoded once before sending)
pub const SLASH_PROBE_PAYLOAD: &str = "probe/segment";

/// Echo endpoint path relative to the probe base
pub const ECHO_PATH: &str = "api/test-encoding/";

/// Probe parameters
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub payload: String,
    pub slash_payload: String,

    /// First candidate layer count
    pub min_candidate: u32,

    /// Last candidate layer count (inclusive)
    pub max_candidate: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            payload: DEFAULT_PROBE_PAYLOAD.to_string(),
            slash_payload: SLASH_PROBE_PAYLOAD.to_string(),
            min_candidate: 4,
            max_candidate: 8,
        }
    }
}

/// Detected proxy behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub decode_depth: u32,
    pub slash_extra_decoding: bool,
}

/// Echo body; older backends only send `received_path`
#[derive(Debug, Deserialize)]
struct EchoReply {
    path: Option<String>,
    received_path: Option<String>,
}

/// Cached encoding probe
pub struct EncodingProbe {
    transport: Arc<dyn Transport>,
    base: Url,
    config: ProbeConfig,
    cached: Mutex<Option<ProbeResult>>,
}

impl EncodingProbe {
    /// `base` is the directory the echo endpoint lives under, e.g. `http://host/proxy/7860/`
    pub fn new(transport: Arc<dyn Transport>, base: Url, config: ProbeConfig) -> Self {
        Self {
            transport,
            base,
            config,
            cached: Mutex::new(None),
        }
    }

    /// Cached result, probing on first use
    pub async fn result(&self) -> ProbeResult {
        let mut cached = self.cached.lock().await;
        if let Some(result) = *cached {
            return result;
        }

        let result = self.run().await;
        *cached = Some(result);
        result
    }

    /// Discard the cached result and probe again
    pub async fn refresh(&self) -> ProbeResult {
        let mut cached = self.cached.lock().await;
        let result = self.run().await;
        *cached = Some(result);
        result
    }

    /// Cached result without probing
    pub async fn cached(&self) -> Option<ProbeResult> {
        *self.cached.lock().await
    }

    async fn run(&self) -> ProbeResult {
        let decode_depth = match self.detect_depth().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!("Encoding probe failed open: {}", e);
                metrics::counter!("subpath_agent_probe_failures_total").increment(1);
                0
            }
        };

        let slash_extra_decoding = self.detect_slash_extra_decoding(decode_depth).await;

        info!(
            "Encoding probe: decode_depth={} slash_extra_decoding={}",
            decode_depth, slash_extra_decoding
        );

        ProbeResult {
            decode_depth,
            slash_extra_decoding,
        }
    }

    /// Find and verify the number of layers the proxy strips
    pub async fn detect_depth(&self) -> Result<u32> {
        let baseline = encode_component(&self.config.payload);
        let mut attempts = 0;

        for candidate in self.config.min_candidate..=self.config.max_candidate {
            attempts += 1;
            let sent = encode_times(&baseline, candidate);

            let returned = match self.echo(&sent).await {
                Ok(returned) => returned,
                Err(e) => {
                    debug!("Probe candidate {} failed: {}", candidate, e);
                    continue;
                }
            };

            let Some(depth) = steps_to_match(&returned, &sent, candidate) else {
                debug!("Probe candidate {} exhausted without a match", candidate);
                continue;
            };

            match self.echo(&encode_times(&baseline, depth)).await {
                Ok(verified) if verified == baseline => {
                    debug!("Probe depth {} verified at candidate {}", depth, candidate);
                    return Ok(depth);
                }
                Ok(other) => {
                    debug!("Probe depth {} rejected: server saw '{}'", depth, other);
                }
                Err(e) => {
                    debug!("Probe verification for depth {} failed: {}", depth, e);
                }
            }
        }

        Err(AgentError::ProbeVerificationFailed { attempts })
    }

    /// Send an encoded separator at `depth` and see whether it comes back split
    pub async fn detect_slash_extra_decoding(&self, depth: u32) -> bool {
        let sent = encode_times(&encode_component(&self.config.slash_payload), depth);

        match self.echo(&sent).await {
            Ok(returned) => split_segments(&returned).len() > 1,
            Err(e) => {
                debug!("Slash probe failed: {}", e);
                false
            }
        }
    }

    async fn echo(&self, opaque: &str) -> Result<String> {
        let url = Url::parse(&format!("{}{}{}", self.base.as_str(), ECHO_PATH, opaque))?;
        let response = self.transport.fetch(InterceptedRequest::get(url)).await?;

        if !response.status().is_success() {
            return Err(AgentError::Transport(format!(
                "Echo endpoint returned {}",
                response.status()
            )));
        }

        let reply: EchoReply = serde_json::from_slice(response.body())?;
        reply
            .path
            .or(reply.received_path)
            .ok_or_else(|| AgentError::Transport("Echo reply without a path".into()))
    }
}

/// Re-encode `returned` until it equals `sent`; the step count is the depth
fn steps_to_match(returned: &str, sent: &str, limit: u32) -> Option<u32> {
    let mut current = returned.to_string();
    for steps in 0..=limit {
        if current == sent {
            return Some(steps);
        }
        current = encode_component(&current);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::decode_times;
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use hyper::{Response, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echo server behind a proxy that strips `depth` layers
    struct SimulatedProxy {
        depth: u32,
        slash_extra: bool,
        calls: AtomicUsize,
    }

    impl SimulatedProxy {
        fn new(depth: u32, slash_extra: bool) -> Arc<Self> {
            Arc::new(Self {
                depth,
                slash_extra,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Transport for SimulatedProxy {
        fn fetch(&self, request: InterceptedRequest) -> BoxFuture<'_, Result<Response<Bytes>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = request.url.path().to_string();
            let opaque = path.split(ECHO_PATH).nth(1).unwrap_or_default().to_string();

            let mut observed = decode_times(&opaque, self.depth);
            if self.slash_extra {
                observed = observed.replace("%2F", "/").replace("%2f", "/");
            }

            let body = serde_json::json!({ "path": observed }).to_string();
            Box::pin(async move { Ok(Response::new(Bytes::from(body))) })
        }
    }

    struct FailingTransport;

    impl Transport for FailingTransport {
        fn fetch(&self, _request: InterceptedRequest) -> BoxFuture<'_, Result<Response<Bytes>>> {
            Box::pin(async {
                let mut response = Response::new(Bytes::new());
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                Ok(response)
            })
        }
    }

    fn base() -> Url {
        Url::parse("http://127.0.0.1:7860/proxy/7860/").unwrap()
    }

    #[test]
    fn test_steps_to_match() {
        let sent = encode_times("x%20y", 3);
        assert_eq!(steps_to_match(&sent, &sent, 3), Some(0));
        assert_eq!(steps_to_match("x%20y", &sent, 3), Some(3));
        assert_eq!(steps_to_match("x%20y", &sent, 2), None);
    }

    #[tokio::test]
    async fn test_detects_every_depth_up_to_eight() {
        for depth in 0..=8 {
            let proxy = SimulatedProxy::new(depth, false);
            let probe = EncodingProbe::new(proxy, base(), ProbeConfig::default());
            assert_eq!(probe.detect_depth().await.unwrap(), depth, "depth {}", depth);
        }
    }

    #[tokio::test]
    async fn test_depth_beyond_candidates_fails_open() {
        let probe = EncodingProbe::new(SimulatedProxy::new(9, false), base(), ProbeConfig::default());
        assert!(matches!(
            probe.detect_depth().await,
            Err(AgentError::ProbeVerificationFailed { attempts: 5 })
        ));
        assert_eq!(probe.result().await.decode_depth, 0);
    }

    #[tokio::test]
    async fn test_unreachable_echo_yields_zero() {
        let probe = EncodingProbe::new(Arc::new(FailingTransport), base(), ProbeConfig::default());
        let result = probe.result().await;
        assert_eq!(result, ProbeResult::default());
    }

    #[tokio::test]
    async fn test_slash_extra_decoding() {
        let probe = EncodingProbe::new(SimulatedProxy::new(2, true), base(), ProbeConfig::default());
        let result = probe.result().await;
        assert_eq!(result.decode_depth, 2);
        assert!(result.slash_extra_decoding);

        let probe = EncodingProbe::new(SimulatedProxy::new(2, false), base(), ProbeConfig::default());
        assert!(!probe.result().await.slash_extra_decoding);
    }

    #[tokio::test]
    async fn test_result_is_cached_until_refresh() {
        let proxy = SimulatedProxy::new(1, false);
        let probe = EncodingProbe::new(proxy.clone(), base(), ProbeConfig::default());

        assert!(probe.cached().await.is_none());
        probe.result().await;
        let after_first = proxy.calls.load(Ordering::SeqCst);
        assert!(after_first > 0);

        probe.result().await;
        assert_eq!(proxy.calls.load(Ordering::SeqCst), after_first);

        probe.refresh().await;
        assert!(proxy.calls.load(Ordering::SeqCst) > after_first);
    }
}
