// packages/subpath-agent/src/interception/transport.rs
//! Network transport seam
//!
//! The agent never talks to the network directly: every real hop (probe
//! round trips, pass-through fetches, tunnel calls) goes through a
//! [`Transport`]. [`HttpTransport`] is the reqwest-backed implementation used
//! by hosts running the agent natively. It speaks both `http` and `https`, so
//! the probe can reach a proxy that only listens behind TLS.

use crate::interception::request::InterceptedRequest;
use crate::utils::errors::{AgentError, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::{Request, Response};
use std::time::Duration;
use tracing::debug;

/// Performs one real network hop
pub trait Transport: Send + Sync {
    fn fetch(&self, request: InterceptedRequest) -> BoxFuture<'_, Result<Response<Bytes>>>;
}

/// HTTP(S) transport over a pooled reqwest client
///
/// Redirects are not followed: a `3xx` from the proxy is handed back to the
/// page untouched, exactly as the browser's own fetch would see it.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .use_rustls_tls()
            .build()
            .map_err(|e| AgentError::Transport(format!("Client setup failed: {}", e)))?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build an outbound request from an intercepted request
    pub fn build_request(request: &InterceptedRequest) -> Result<Request<Bytes>> {
        match request.url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(AgentError::Transport(format!(
                    "Unsupported scheme '{}'",
                    other
                )))
            }
        }

        let body = if request.carries_body() {
            request.body.clone().unwrap_or_default()
        } else {
            Bytes::new()
        };

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());

        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
        }

        Ok(builder.body(body)?)
    }

    async fn execute(&self, request: InterceptedRequest) -> Result<Response<Bytes>> {
        debug!("Transport fetch: {} {}", request.method, request.url);

        let outbound = reqwest::Request::try_from(Self::build_request(&request)?)
            .map_err(|e| AgentError::Transport(format!("Invalid request: {}", e)))?;

        let response = tokio::time::timeout(self.timeout, self.client.execute(outbound))
            .await
            .map_err(|_| AgentError::Transport(format!("Timed out after {:?}", self.timeout)))?
            .map_err(|e| AgentError::Transport(format!("Request failed: {}", e)))?;

        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| AgentError::Transport(format!("Response body error: {}", e)))?;

        let mut builder = Response::builder().status(status).version(version);
        if let Some(target) = builder.headers_mut() {
            target.extend(headers);
        }

        Ok(builder.body(body)?)
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, request: InterceptedRequest) -> BoxFuture<'_, Result<Response<Bytes>>> {
        Box::pin(self.execute(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;
    use url::Url;

    #[test]
    fn test_build_request_drops_get_body() {
        let req = InterceptedRequest::get(Url::parse("http://localhost:8080/a").unwrap())
            .with_body("ignored")
            .with_header("accept", "application/json");

        let built = HttpTransport::build_request(&req).unwrap();
        assert_eq!(built.method(), Method::GET);
        assert_eq!(built.uri(), "http://localhost:8080/a");
        assert_eq!(built.headers().get("accept").unwrap(), "application/json");
        assert!(built.body().is_empty());
    }

    #[test]
    fn test_build_request_accepts_https() {
        let req = InterceptedRequest::get(
            Url::parse("https://proxy.example.com/proxy/8080/__echo__/a%252Fb").unwrap(),
        );

        let built = HttpTransport::build_request(&req).unwrap();
        assert_eq!(built.uri().scheme_str(), Some("https"));
        assert_eq!(built.uri().path(), "/proxy/8080/__echo__/a%252Fb");
    }

    #[test]
    fn test_build_request_rejects_other_schemes() {
        let req = InterceptedRequest::get(Url::parse("ftp://example.com/").unwrap());
        assert!(matches!(
            HttpTransport::build_request(&req),
            Err(AgentError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_https_request_reaches_the_network() {
        // Nothing listens on port 1, so the failure must come from the
        // connect attempt rather than from scheme validation.
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let req = InterceptedRequest::get(Url::parse("https://127.0.0.1:1/").unwrap());

        match transport.fetch(req).await {
            Err(AgentError::Transport(msg)) => {
                assert!(msg.starts_with("Request failed"), "unexpected: {msg}")
            }
            other => panic!("expected transport error, got {:?}", other.map(|r| r.status())),
        }
    }

    #[tokio::test]
    async fn test_fetch_unreachable_is_transport_error() {
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let req = InterceptedRequest::get(Url::parse("http://127.0.0.1:1/").unwrap());
        let result = transport.fetch(req).await;
        assert!(matches!(result, Err(AgentError::Transport(_))));
    }
}
