//! HTTP backend against a mock server.

#![cfg(feature = "http")]

use ai_relay::config::{RelayConfig, ServiceConfig};
use ai_relay::{ErrorKind, QueryRequest, RelayClient, RetryPolicy};
use mockito::{Matcher, Server, ServerGuard};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn config(server: &ServerGuard) -> RelayConfig {
    let mut config = RelayConfig::new(ServiceConfig::new(
        "http_mock",
        server.url(),
        "test-key",
        "test-model",
    ));
    config.service.max_retries = 0;
    config.service.timeout_secs = 5.0;
    config.connection.base_delay_secs = 0.01;
    config.connection.max_delay_secs = 0.05;
    config.query_retry.max_retries = 0;
    config
}

async fn healthy(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("GET", "/health")
        .match_query(Matcher::UrlEncoded(
            "api-version".into(),
            "2024-02-15-preview".into(),
        ))
        .match_header("authorization", "Bearer test-key")
        .with_status(200)
        .create_async()
        .await
}

#[tokio::test]
async fn test_query_round_trip() {
    let mut server = Server::new_async().await;
    let health = healthy(&mut server).await;
    let query = server
        .mock("POST", "/v1/query")
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer test-key")
        .match_body(Matcher::PartialJson(json!({
            "query": "hello",
            "deployment": "test-model",
            "max_tokens": 128,
            "stream": false,
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"content":"hi there","metadata":{"model":"m-1"}}"#)
        .create_async()
        .await;

    let client = RelayClient::builder(config(&server)).build().unwrap();
    assert!(client.initialize().await.unwrap());

    let resp = client
        .ask(QueryRequest::new("hello").unwrap().max_tokens(128))
        .await;
    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(resp.content, "hi there");
    assert_eq!(resp.metadata.get("model"), Some(&json!("m-1")));
    assert!(resp.response_time.is_some());

    health.assert_async().await;
    query.assert_async().await;
    client.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let mut server = Server::new_async().await;
    let _health = healthy(&mut server).await;
    let _query = server
        .mock("POST", "/v1/query")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("retry-after", "7")
        .with_body("too many requests")
        .create_async()
        .await;

    let client = RelayClient::builder(config(&server))
        .with_query_policy(RetryPolicy::none())
        .build()
        .unwrap();
    let err = client
        .processor()
        .process_query(&QueryRequest::new("hello").unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimit);
    assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(7)));
    assert_eq!(err.message(), "HTTP 429: too many requests");
}

#[tokio::test]
async fn test_server_error_becomes_unsuccessful_response() {
    let mut server = Server::new_async().await;
    let _health = healthy(&mut server).await;
    let _query = server
        .mock("POST", "/v1/query")
        .match_query(Matcher::Any)
        .with_status(500)
        .create_async()
        .await;

    let client = RelayClient::builder(config(&server)).build().unwrap();
    let resp = client.ask_text("hello").await;
    assert!(!resp.success);
    assert_eq!(resp.error_type.as_deref(), Some("service_error"));
    assert_eq!(resp.error.as_deref(), Some("HTTP 500"));
}

#[tokio::test]
async fn test_unhealthy_endpoint_fails_initialize() {
    let mut server = Server::new_async().await;
    let _health = server
        .mock("GET", "/health")
        .match_query(Matcher::Any)
        .with_status(503)
        .create_async()
        .await;

    let client = RelayClient::builder(config(&server)).build().unwrap();
    let err = client.initialize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(!client.health().await.healthy);
}

#[tokio::test]
async fn test_streamed_answer() {
    let mut server = Server::new_async().await;
    let _health = healthy(&mut server).await;
    let body = concat!(
        "data: {\"content\":\"Hello\"}\n\n",
        ": keep-alive\n\n",
        "data: {\"content\":\", \"}\n\n",
        "data: {\"content\":\"world\"}\n\n",
        "data: [DONE]\n\n",
    );
    let stream = server
        .mock("POST", "/v1/query")
        .match_query(Matcher::Any)
        .match_header("accept", "text/event-stream")
        .match_body(Matcher::PartialJson(json!({"stream": true})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let client = RelayClient::builder(config(&server)).build().unwrap();
    let seen = Arc::new(Mutex::new(String::new()));
    let sink = seen.clone();
    let task = client
        .ask_streaming(QueryRequest::new("greet").unwrap(), move |text: &str| {
            sink.lock().unwrap().push_str(text)
        })
        .await
        .unwrap();
    let outcome = task.wait().await;

    assert!(outcome.is_success());
    assert_eq!(outcome.chunks_delivered, 4);
    assert_eq!(seen.lock().unwrap().as_str(), "Hello, world");
    stream.assert_async().await;
}

#[tokio::test]
async fn test_invalid_endpoint_rejected_at_build() {
    let config = RelayConfig::new(ServiceConfig::new("http_mock", "not a url", "key", "model"));
    let err = RelayClient::builder(config).build().err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
