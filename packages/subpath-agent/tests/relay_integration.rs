// packages/subpath-agent/tests/relay_integration.rs
//! Relay endpoints against a live loopback backend

mod common;

use bytes::Bytes;
use hyper::{Method, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use subpath_agent::encoding::{EncodingProbe, ProbeConfig};
use subpath_agent::interception::tunnel_codec::RELAY_ERROR_HEADER;
use subpath_agent::interception::{HttpTransport, InterceptedRequest, Transport, TunnelCodec, TunnelEnvelope};
use std::sync::Arc;
use url::Url;

fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_secs(5)).unwrap()
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn envelope_request(relay: std::net::SocketAddr, envelope: &TunnelEnvelope) -> InterceptedRequest {
    InterceptedRequest::new(Method::POST, url(&format!("http://{}/api/tunnel", relay)))
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_vec(envelope).unwrap())
}

#[tokio::test]
async fn test_health_and_echo() {
    let (relay, token) = common::spawn_relay("/").await;
    let transport = transport();

    let health = transport
        .fetch(InterceptedRequest::get(url(&format!("http://{}/health", relay))))
        .await
        .unwrap();
    assert_eq!(health.body().as_ref(), b"ok");

    let echo = transport
        .fetch(InterceptedRequest::get(url(&format!(
            "http://{}/api/test-encoding/a%2520b",
            relay
        ))))
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(echo.body()).unwrap();
    assert_eq!(body["path"], "a%2520b");
    assert_eq!(body["received_path"], "a%2520b");
    assert!(body["timestamp"].as_f64().unwrap() > 0.0);

    token.cancel();
}

#[tokio::test]
async fn test_probe_against_direct_relay_finds_no_decoding() {
    let (relay, token) = common::spawn_relay("/").await;
    let probe = EncodingProbe::new(
        Arc::new(transport()),
        url(&format!("http://{}/", relay)),
        ProbeConfig::default(),
    );

    let result = probe.result().await;
    assert_eq!(result.decode_depth, 0);
    assert!(!result.slash_extra_decoding);

    token.cancel();
}

#[tokio::test]
async fn test_envelope_round_trip() {
    let backend = common::spawn_backend().await;
    let (relay, token) = common::spawn_relay("/").await;

    let mut headers = BTreeMap::new();
    headers.insert("x-test".to_string(), "a, b".to_string());
    headers.insert("connection".to_string(), "keep-alive".to_string());
    let envelope = TunnelEnvelope {
        method: "POST".into(),
        url: format!("http://127.0.0.1:{}/api/data%2Ffile?q=1", backend.port()),
        headers,
        body: Some(b"payload".to_vec()),
    };

    let reply = transport().fetch(envelope_request(relay, &envelope)).await.unwrap();
    assert_eq!(reply.status(), StatusCode::OK);

    let response = TunnelCodec::decode_reply(reply.body()).unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-backend").unwrap(), "yes");

    let described: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(described["method"], "POST");
    assert_eq!(described["path"], "/api/data%2Ffile?q=1");
    assert_eq!(described["x_test"], "a, b");
    assert_eq!(described["body"], "payload");

    token.cancel();
}

#[tokio::test]
async fn test_envelope_refuses_remote_target() {
    let (relay, token) = common::spawn_relay("/").await;
    let envelope = TunnelEnvelope {
        method: "GET".into(),
        url: "http://example.com/".into(),
        headers: BTreeMap::new(),
        body: None,
    };

    let reply = transport().fetch(envelope_request(relay, &envelope)).await.unwrap();
    assert_eq!(reply.status(), StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_slice(reply.body()).unwrap();
    assert!(body["error"].as_str().unwrap().contains("non-loopback"));
    assert!(TunnelCodec::decode_reply(reply.body()).is_err());

    token.cancel();
}

#[tokio::test]
async fn test_path_parameter_relay_rewrites_origin() {
    let backend = common::spawn_backend().await;
    let (relay, token) = common::spawn_relay("/").await;

    let request = InterceptedRequest::get(url(&format!(
        "http://{}/api/http-tunnel/{}?u=%2Fecho%3Fq%3D1",
        relay,
        backend.port()
    )))
    .with_header("origin", "https://proxy.example")
    .with_header("referer", "https://proxy.example/proxy/8080/page")
    .with_header("proxy-connection", "keep-alive");

    let response = transport().fetch(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(RELAY_ERROR_HEADER).is_none());

    let described: Value = serde_json::from_slice(response.body()).unwrap();
    let origin = format!("http://localhost:{}", backend.port());
    assert_eq!(described["path"], "/echo?q=1");
    assert_eq!(described["origin"], origin.as_str());
    assert_eq!(described["referer"], format!("{}/", origin).as_str());
    assert_eq!(described["proxy_connection"], Value::Null);

    token.cancel();
}

#[tokio::test]
async fn test_path_parameter_relay_flags_failures() {
    let (relay, token) = common::spawn_relay("/").await;
    let port = common::closed_port().await;

    let response = transport()
        .fetch(InterceptedRequest::get(url(&format!(
            "http://{}/api/http-tunnel/{}?u=%2F",
            relay, port
        ))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(response.headers().get(RELAY_ERROR_HEADER).unwrap(), "connect");

    let missing = transport()
        .fetch(InterceptedRequest::get(url(&format!(
            "http://{}/api/http-tunnel/{}",
            relay, port
        ))))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert!(missing.headers().get(RELAY_ERROR_HEADER).is_some());

    token.cancel();
}

#[tokio::test]
async fn test_routes_outside_base_path_are_not_found() {
    let (relay, token) = common::spawn_relay("/relay/").await;

    let response = transport()
        .fetch(InterceptedRequest::get(url(&format!("http://{}/health", relay))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let scoped = transport()
        .fetch(InterceptedRequest::get(url(&format!("http://{}/relay/health", relay))))
        .await
        .unwrap();
    assert_eq!(scoped.body(), &Bytes::from_static(b"ok"));

    token.cancel();
}
