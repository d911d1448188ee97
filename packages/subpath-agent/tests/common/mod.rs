// packages/subpath-agent/tests/common/mod.rs
//! Loopback fixtures shared by the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subpath_agent::relay::{RelayConfig, RelayServer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Backend that describes every request it receives as JSON
pub async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(describe_request);
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

async fn describe_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    let origin = header("origin");
    let referer = header("referer");
    let custom = header("x-test");
    let proxy_connection = header("proxy-connection");

    let body = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();

    let description = json!({
        "method": method,
        "path": path,
        "origin": origin,
        "referer": referer,
        "x_test": custom,
        "proxy_connection": proxy_connection,
        "body": String::from_utf8_lossy(&body),
    });

    let mut response = Response::new(Full::new(Bytes::from(description.to_string())));
    response
        .headers_mut()
        .insert("content-type", "application/json".parse().unwrap());
    response
        .headers_mut()
        .insert("x-backend", "yes".parse().unwrap());
    Ok(response)
}

/// Relay serving under `base_path` on an ephemeral loopback port
pub async fn spawn_relay(base_path: &str) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let relay = Arc::new(RelayServer::new(RelayConfig {
        listen_addr: addr,
        base_path: base_path.to_string(),
        request_timeout: Duration::from_secs(5),
    }));

    let token = CancellationToken::new();
    let serve_token = token.clone();
    tokio::spawn(async move {
        let _ = relay.serve(listener, serve_token).await;
    });

    (addr, token)
}

/// A loopback port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
