// packages/subpath-agent/src/relay/server.rs
//! Relay HTTP server
//!
//! Accepts HTTP/1.1 connections, serves the probe endpoints and forwards
//! tunnelled requests to `localhost:<port>`.

use crate::encoding::probe::{DEFAULT_PROBE_PAYLOAD, ECHO_PATH};
use crate::interception::tunnel_codec::{
    flatten_headers, is_hop_by_hop, ENVELOPE_ENDPOINT, PATH_TUNNEL_ENDPOINT, RELAY_ERROR_HEADER,
    REMAINDER_PARAM,
};
use crate::interception::{RelayResponse, TunnelEnvelope};
use crate::relay::RelayConfig;
use crate::utils::errors::{AgentError, Result};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, ORIGIN, REFERER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::{Host, Url};

/// Response body type of the relay
pub type RelayBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Relay HTTP server
pub struct RelayServer {
    config: RelayConfig,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { config, client }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.config.listen_addr).await?)
    }

    /// Bind and serve until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` fires
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(
            "Relay listening on {} under {}",
            listener.local_addr()?,
            self.config.base_path
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Relay shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(connection) => connection,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let server = Arc::clone(&self);
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                debug!("Accepted connection from {}", peer);

                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, AgentError>(server.handle_request(req, peer).await) }
                });

                let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                tokio::pin!(connection);

                let result = tokio::select! {
                    result = connection.as_mut() => result,
                    _ = shutdown.cancelled() => {
                        connection.as_mut().graceful_shutdown();
                        connection.await
                    }
                };
                if let Err(e) = result {
                    debug!("Connection error from {}: {}", peer, e);
                }
            });
        }
    }

    /// Route one request
    async fn handle_request(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<RelayBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("Relay request from {}: {} {}", peer, method, req.uri());

        let Some(route) = path.strip_prefix(self.config.base_path.as_str()) else {
            return text_response(StatusCode::NOT_FOUND, "not found");
        };

        if let Some(opaque) = route.strip_prefix(ECHO_PATH) {
            if method == Method::GET {
                return echo_response(opaque, req.uri());
            }
        }

        if let Some(port) = route.strip_prefix(PATH_TUNNEL_ENDPOINT) {
            let port = port.to_string();
            return self.relay_path_parameter(req, &port).await;
        }

        match (&method, route) {
            (&Method::GET, "health") => text_response(StatusCode::OK, "ok"),
            (&Method::GET, "api/nginx-encoding-test") => json_response(
                StatusCode::OK,
                &json!({
                    "test_path": format!("{}{}{}", self.config.base_path, ECHO_PATH, DEFAULT_PROBE_PAYLOAD),
                    "description": "Probe path sent unencoded to detect proxy-side URL decoding",
                }),
            ),
            (&Method::POST, ENVELOPE_ENDPOINT) => self.relay_envelope(req).await,
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    /// `POST api/tunnel`: unpack the envelope, perform it, pack the reply
    async fn relay_envelope(&self, req: Request<Incoming>) -> Response<RelayBody> {
        match self.perform_envelope(req).await {
            Ok(reply) => match serde_json::to_value(&reply) {
                Ok(value) => json_response(StatusCode::OK, &value),
                Err(e) => relay_failure_json(&e.into()),
            },
            Err(e) => {
                warn!("Envelope relay failed: {}", e);
                relay_failure_json(&e)
            }
        }
    }

    async fn perform_envelope(&self, req: Request<Incoming>) -> Result<RelayResponse> {
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| AgentError::Transport(format!("Body read error: {}", e)))?
            .to_bytes();
        let envelope: TunnelEnvelope = serde_json::from_slice(&body)?;

        let target = Url::parse(&envelope.url)?;
        if !is_loopback_target(&target) {
            return Err(AgentError::Transport(format!(
                "Refusing non-loopback target {}",
                envelope.url
            )));
        }

        let method = Method::from_bytes(envelope.method.as_bytes())
            .map_err(|_| AgentError::Transport(format!("Invalid method '{}'", envelope.method)))?;

        let mut builder = Request::builder().method(method).uri(target.as_str());
        if let Some(headers) = builder.headers_mut() {
            for (name, value) in &envelope.headers {
                if !is_forwardable(name) {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
        }
        let outbound = builder.body(Full::new(Bytes::from(envelope.body.unwrap_or_default())))?;

        debug!("Relaying envelope to {}", target);
        let response = tokio::time::timeout(self.config.request_timeout, async {
            let response = self
                .client
                .request(outbound)
                .await
                .map_err(|e| AgentError::Transport(format!("Upstream request failed: {}", e)))?;
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| AgentError::Transport(format!("Upstream body error: {}", e)))?
                .to_bytes();
            Ok::<_, AgentError>((parts, body))
        })
        .await
        .map_err(|_| {
            AgentError::Transport(format!("Timed out after {:?}", self.config.request_timeout))
        })??;

        let (parts, body) = response;
        Ok(RelayResponse {
            status: parts.status.as_u16(),
            status_text: parts.status.canonical_reason().unwrap_or_default().to_string(),
            headers: flatten_headers(&parts.headers),
            body: Some(body.to_vec()),
        })
    }

    /// `api/http-tunnel/<port>?u=<remainder>`: forward and stream the reply back
    async fn relay_path_parameter(&self, req: Request<Incoming>, port: &str) -> Response<RelayBody> {
        let port = match port.parse::<u16>() {
            Ok(port) if port >= 1 => port,
            _ => return relay_failure(StatusCode::BAD_REQUEST, "invalid-port", "Invalid port"),
        };

        let Some(remainder) = remainder_param(req.uri()) else {
            return relay_failure(StatusCode::BAD_REQUEST, "missing-target", "Missing target path");
        };

        let target = format!("http://localhost:{}{}", port, remainder);
        let target_origin = format!("http://localhost:{}", port);

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => return relay_failure(StatusCode::BAD_REQUEST, "body", &e.to_string()),
        };

        let mut builder = Request::builder().method(parts.method).uri(target.as_str());
        if let Some(headers) = builder.headers_mut() {
            *headers = forwarded_headers(&parts.headers, &target_origin);
        }
        let outbound = match builder.body(Full::new(body)) {
            Ok(outbound) => outbound,
            Err(e) => return relay_failure(StatusCode::BAD_REQUEST, "request", &e.to_string()),
        };

        debug!("Relaying path-parameter request to {}", target);
        let response = match tokio::time::timeout(self.config.request_timeout, self.client.request(outbound)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("Upstream {} failed: {}", target, e);
                return relay_failure(StatusCode::BAD_GATEWAY, "connect", &e.to_string());
            }
            Err(_) => {
                warn!("Upstream {} timed out", target);
                return relay_failure(StatusCode::GATEWAY_TIMEOUT, "timeout", "Upstream timed out");
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Response::from_parts(parts, body.boxed_unsync())
    }
}

/// `localhost`, `127.0.0.0/8` or `::1` over plain HTTP
fn is_loopback_target(url: &Url) -> bool {
    if url.scheme() != "http" {
        return false;
    }
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

fn is_forwardable(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    !is_hop_by_hop(&lower) && lower != HOST.as_str() && lower != CONTENT_LENGTH.as_str()
}

/// Decoded `u` parameter, always starting with `/`
fn remainder_param(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    let raw = query.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name == REMAINDER_PARAM).then_some(value)
    })?;

    let decoded = urlencoding::decode(raw).ok()?.into_owned();
    if decoded.starts_with('/') {
        Some(decoded)
    } else {
        Some(format!("/{}", decoded))
    }
}

/// Request headers for the upstream hop, with Origin and Referer pointed at it
fn forwarded_headers(incoming: &HeaderMap, target_origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if is_forwardable(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    if headers.contains_key(ORIGIN) {
        if let Ok(origin) = HeaderValue::from_str(target_origin) {
            headers.insert(ORIGIN, origin);
        }
    }
    if headers.contains_key(REFERER) {
        if let Ok(referer) = HeaderValue::from_str(&format!("{}/", target_origin)) {
            headers.insert(REFERER, referer);
        }
    }
    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(name);
    }
}

fn echo_response(opaque: &str, uri: &Uri) -> Response<RelayBody> {
    let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    json_response(
        StatusCode::OK,
        &json!({
            "path": opaque,
            "received_path": opaque,
            "message": "received",
            "original_url": uri.to_string(),
            "timestamp": timestamp,
        }),
    )
}

fn full(body: impl Into<Bytes>) -> RelayBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed_unsync()
}

fn text_response(status: StatusCode, message: &str) -> Response<RelayBody> {
    let mut response = Response::new(full(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<RelayBody> {
    let mut response = Response::new(full(value.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// `{error}` reply of the envelope relay
fn relay_failure_json(error: &AgentError) -> Response<RelayBody> {
    json_response(StatusCode::BAD_GATEWAY, &json!({ "error": error.to_string() }))
}

/// Failure of the path-parameter relay, flagged so the agent can fall back
fn relay_failure(status: StatusCode, reason: &'static str, message: &str) -> Response<RelayBody> {
    let mut response = text_response(status, message);
    response
        .headers_mut()
        .insert(RELAY_ERROR_HEADER, HeaderValue::from_static(reason));
    response
}
