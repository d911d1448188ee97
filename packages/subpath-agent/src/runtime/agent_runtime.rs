// packages/subpath-agent/src/runtime/agent_runtime.rs
//! Request-interception agent
//!
//! One [`AgentRuntime`] owns the scope, the active strategy and the
//! components that act on intercepted requests. Each intercepted event is an
//! independent `handle_fetch` future; control messages are applied by a
//! single `serve_control` task.
//!
//! # Dispatch
//!
//! ```text
//! snapshot config
//!   none / cross-origin  → network
//!   subpath              → PathRewriter
//!   tunnel               → TunnelCodec if triggered, else network
//!   hybrid               → select_route → TunnelCodec | PathRewriter
//! ```

use crate::control::{
    ClientNavigator, ConfigChannel, ConfigController, ConfigReply, ControlMessage, ControlOutcome,
    ControlRequest, Strategy, StrategyConfig,
};
use crate::interception::{
    select_route, InterceptedRequest, LoopMarkerKind, NavigationInjector, PathRewriter,
    RewriteDecision, Route, Scope, Transport, TunnelCodec, TunnelVariant,
};
use crate::interception::loop_marker::DEFAULT_MARKER_PARAM;
use crate::interception::tunnel_codec::RELAY_ERROR_HEADER;
use crate::utils::errors::{AgentError, Result};
use bytes::Bytes;
use hyper::header::{HeaderValue, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Queue depth of the control channel in each direction
const CONTROL_QUEUE_DEPTH: usize = 32;

/// Configuration for an agent instance
#[derive(Debug, Clone)]
pub struct AgentRuntimeConfig {
    /// Path prefix the agent intercepts within
    pub scope: Scope,

    /// URL the agent itself was loaded from; fixes the origin and relay base
    pub agent_url: Url,

    /// How rewritten requests are recognised on replay
    pub loop_marker: LoopMarkerKind,

    /// Query parameter used by the query marker
    pub marker_param: String,

    /// Relay protocol used by the tunnel strategy
    pub tunnel_variant: TunnelVariant,

    /// Inject the navigation script into HTML documents
    pub inject_navigation: bool,
}

impl AgentRuntimeConfig {
    pub fn new(scope: Scope, agent_url: Url) -> Self {
        Self {
            scope,
            agent_url,
            loop_marker: LoopMarkerKind::default(),
            marker_param: DEFAULT_MARKER_PARAM.to_string(),
            tunnel_variant: TunnelVariant::default(),
            inject_navigation: true,
        }
    }
}

/// The interception agent
pub struct AgentRuntime {
    config: AgentRuntimeConfig,
    channel: ConfigChannel,
    rewriter: PathRewriter,
    codec: TunnelCodec,
    injector: NavigationInjector,
    transport: Arc<dyn Transport>,
}

impl AgentRuntime {
    pub fn new(
        config: AgentRuntimeConfig,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn ClientNavigator>,
    ) -> Self {
        let marker = config.loop_marker.build(&config.marker_param);
        let rewriter = PathRewriter::new(config.scope.clone(), marker);
        let codec = TunnelCodec::new(config.scope.clone(), &config.agent_url);
        let injector = NavigationInjector::new(config.scope.clone());

        info!(
            "Agent started for scope {} (tunnel port: {:?})",
            config.scope,
            codec.port()
        );

        Self {
            config,
            channel: ConfigChannel::new(navigator),
            rewriter,
            codec,
            injector,
            transport,
        }
    }

    pub fn config(&self) -> &AgentRuntimeConfig {
        &self.config
    }

    pub fn scope(&self) -> &Scope {
        &self.config.scope
    }

    pub fn codec(&self) -> &TunnelCodec {
        &self.codec
    }

    /// Active strategy configuration, `None` before the first `CONFIGURE`
    pub fn strategy_config(&self) -> Option<StrategyConfig> {
        self.channel.current()
    }

    /// Handle one intercepted request
    pub async fn handle_fetch(&self, request: InterceptedRequest) -> Response<Bytes> {
        let config = self.channel.snapshot();

        if config.strategy == Strategy::None || !request.is_same_origin(&self.config.agent_url) {
            record_dispatch("passthrough");
            return self.passthrough(request, false).await;
        }

        let inject = self.config.inject_navigation && request.is_navigation();
        let route = match config.strategy {
            Strategy::Tunnel => Route::Tunnel,
            Strategy::Hybrid => select_route(request.url.path(), config.slash_extra_decoding),
            _ => Route::Subpath,
        };

        if route == Route::Tunnel && self.codec.should_tunnel(&request, &self.config.agent_url) {
            record_dispatch("tunnel");
            return self.tunnel(request).await;
        }

        if config.strategy == Strategy::Tunnel {
            record_dispatch("passthrough");
            return self.passthrough(request, inject).await;
        }

        self.subpath(request, config.decode_depth, inject).await
    }

    async fn subpath(&self, request: InterceptedRequest, decode_depth: u32, inject: bool) -> Response<Bytes> {
        match self.rewriter.decide(&request.url, decode_depth) {
            RewriteDecision::Passthrough => {
                record_dispatch("passthrough");
                self.passthrough(request, inject).await
            }
            RewriteDecision::Forward(clean) => {
                record_dispatch("forward");
                self.passthrough(request.with_url(clean), inject).await
            }
            RewriteDecision::Redirect(target) => {
                record_dispatch("redirect");
                redirect_response(&target)
            }
        }
    }

    /// Relay through the tunnel, falling back to the original request
    async fn tunnel(&self, request: InterceptedRequest) -> Response<Bytes> {
        match self.relay(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Tunnel failed for {}: {}; falling back", request.url, e);
                counter!("subpath_agent_tunnel_fallbacks_total").increment(1);
                self.passthrough(request, false).await
            }
        }
    }

    async fn relay(&self, request: &InterceptedRequest) -> Result<Response<Bytes>> {
        match self.config.tunnel_variant {
            TunnelVariant::Envelope => {
                let response = self.transport.fetch(self.codec.envelope_request(request)?).await?;
                if !response.status().is_success() {
                    return Err(AgentError::Transport(format!(
                        "Relay returned {}",
                        response.status()
                    )));
                }
                TunnelCodec::decode_reply(response.body())
            }
            TunnelVariant::PathParameter => {
                let response = self
                    .transport
                    .fetch(self.codec.path_parameter_request(request)?)
                    .await?;
                if let Some(reason) = response.headers().get(RELAY_ERROR_HEADER) {
                    return Err(AgentError::Transport(format!(
                        "Relay failure: {}",
                        reason.to_str().unwrap_or("unknown")
                    )));
                }
                Ok(response)
            }
        }
    }

    /// Send the request unmodified
    async fn passthrough(&self, mut request: InterceptedRequest, inject: bool) -> Response<Bytes> {
        let url = request.url.clone();
        if inject {
            // The script can only be spliced into an uncompressed document
            request.headers.remove(ACCEPT_ENCODING);
        }
        if let Some(client_id) = request.client_id.as_deref() {
            if request.is_navigation() && request.is_same_origin(&self.config.agent_url) {
                self.channel.observe(client_id, &url);
            }
        }

        match self.transport.fetch(request).await {
            Ok(response) if inject => self.injector.inject_response(response),
            Ok(response) => response,
            Err(e) => {
                warn!("Fetch failed for {}: {}", url, e);
                error_response(StatusCode::BAD_GATEWAY, &e.to_string())
            }
        }
    }

    /// Apply one control message
    pub async fn handle_control(&self, message: ControlMessage) -> ControlOutcome {
        debug!("Control message: {:?}", message);
        self.channel.handle(message).await
    }

    /// Process control requests in order until the sender goes away
    pub async fn serve_control(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<ControlRequest>,
        replies: mpsc::Sender<ConfigReply>,
    ) {
        while let Some(request) = requests.recv().await {
            if let ControlOutcome::Config(config) = self.handle_control(request.message).await {
                if replies
                    .send(ConfigReply {
                        id: request.id,
                        config,
                    })
                    .await
                    .is_err()
                {
                    debug!("Config reply dropped, controller gone");
                }
            }
        }
        info!("Control channel closed");
    }

    /// Start the control task and return a connected controller
    pub fn spawn_control(self: &Arc<Self>, timeout: Duration) -> (ConfigController, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let (reply_tx, reply_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let task = tokio::spawn(Arc::clone(self).serve_control(request_rx, reply_tx));
        (ConfigController::new(request_tx, reply_rx, timeout), task)
    }
}

fn record_dispatch(route: &'static str) {
    counter!("subpath_agent_dispatch_total", "route" => route).increment(1);
}

/// Method-preserving redirect to `target`
fn redirect_response(target: &Url) -> Response<Bytes> {
    let location = match HeaderValue::from_str(target.as_str()) {
        Ok(value) => value,
        Err(e) => return error_response(StatusCode::BAD_GATEWAY, &e.to_string()),
    };

    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::TEMPORARY_REDIRECT;
    response.headers_mut().insert(LOCATION, location);
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
