//! Shared mock backends for integration tests.

#![allow(dead_code)]

use ai_relay::adapter::managed::{Backend, BackendRequest};
use ai_relay::adapter::ChunkStream;
use ai_relay::config::{RelayConfig, ServiceConfig};
use ai_relay::connection::Connector;
use ai_relay::{AiResponse, Error, Result, StreamingChunk};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a scripted stream yields, in order.
pub type StreamScript = Vec<Result<StreamingChunk>>;

/// Counters and scripts shared between a [`MockBackend`] and the test.
#[derive(Default)]
pub struct MockState {
    /// Remaining connect calls that fail with a connection error.
    pub connect_failures: AtomicU32,
    /// When set, every health probe fails.
    pub unhealthy: AtomicBool,
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    pub probes: AtomicU32,
    pub queries: AtomicU32,
    pub streams: AtomicU32,
    /// Sessions (connect numbers) seen by each query, in order.
    pub sessions: Mutex<Vec<u32>>,
    /// Requests as the backend received them.
    pub requests: Mutex<Vec<BackendRequest>>,
    query_script: Mutex<VecDeque<Result<AiResponse>>>,
    stream_script: Mutex<VecDeque<Result<StreamScript>>>,
    /// Delay before every streamed item.
    item_delay: Mutex<Option<Duration>>,
}

impl MockState {
    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    pub fn push_query(&self, outcome: Result<AiResponse>) {
        self.query_script.lock().unwrap().push_back(outcome);
    }

    pub fn push_stream(&self, outcome: Result<StreamScript>) {
        self.stream_script.lock().unwrap().push_back(outcome);
    }

    pub fn set_item_delay(&self, delay: Duration) {
        *self.item_delay.lock().unwrap() = Some(delay);
    }
}

/// A backend whose behavior is scripted through [`MockState`].
///
/// Sessions are numbered by connect call, starting at 1. Unscripted queries
/// echo the query text; unscripted streams yield its words.
#[derive(Clone)]
pub struct MockBackend {
    endpoint: String,
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_endpoint("https://mock.test/v1")
    }

    pub fn with_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            state: Arc::new(MockState::default()),
        }
    }

    pub fn state(&self) -> Arc<MockState> {
        self.state.clone()
    }
}

#[async_trait]
impl Connector for MockBackend {
    type Session = u32;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<u32> {
        let n = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.state.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(Error::connection("connection refused"));
        }
        Ok(n)
    }

    async fn health_check(&self, _session: &u32) -> Result<()> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        if self.state.unhealthy.load(Ordering::SeqCst) {
            return Err(Error::connection("probe failed"));
        }
        Ok(())
    }

    async fn disconnect(&self, _session: Arc<u32>) -> Result<()> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn provider(&self) -> &str {
        "mock"
    }

    async fn query(&self, session: &u32, request: &BackendRequest) -> Result<AiResponse> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        self.state.sessions.lock().unwrap().push(*session);
        self.state.requests.lock().unwrap().push(request.clone());
        let scripted = self.state.query_script.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(AiResponse::success(format!("echo: {}", request.query))),
        }
    }

    async fn stream(&self, _session: Arc<u32>, request: &BackendRequest) -> Result<ChunkStream> {
        self.state.streams.fetch_add(1, Ordering::SeqCst);
        self.state.requests.lock().unwrap().push(request.clone());
        let scripted = self.state.stream_script.lock().unwrap().pop_front();
        let items = match scripted {
            Some(outcome) => outcome?,
            None => words(&request.query),
        };
        let delay = *self.state.item_delay.lock().unwrap();
        let stream = futures::stream::iter(items).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(stream.boxed())
    }
}

/// One chunk per whitespace-separated word (with its trailing space), then
/// the terminal chunk.
pub fn words(text: &str) -> StreamScript {
    let parts: Vec<&str> = text.split_inclusive(' ').collect();
    chunks(&parts)
}

/// Numbered chunks for `parts`, then the terminal chunk.
pub fn chunks(parts: &[&str]) -> StreamScript {
    let mut items: StreamScript = parts
        .iter()
        .enumerate()
        .map(|(i, p)| Ok(StreamingChunk::new(*p, i as u64)))
        .collect();
    items.push(Ok(StreamingChunk::terminal(parts.len() as u64)));
    items
}

/// Config for tests: connection budget 2, query budget 2, short delays.
pub fn test_config(endpoint: &str) -> RelayConfig {
    let mut config = RelayConfig::new(ServiceConfig::new(
        "mock",
        endpoint,
        "test-key",
        "test-model",
    ));
    config.service.max_retries = 2;
    config.service.timeout_secs = 5.0;
    config.connection.base_delay_secs = 1.0;
    config.connection.max_delay_secs = 4.0;
    config.query_retry.max_retries = 2;
    config.query_retry.base_delay_secs = 1.0;
    config.query_retry.max_delay_secs = 4.0;
    config
}
