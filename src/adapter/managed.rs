//! Generic adapter over a [`Backend`].
//!
//! The backend only knows how to talk to one service over an established
//! session. `ManagedAdapter` supplies the rest: it reaches the session through
//! the [`ConnectionManager`], fills unset parameters from configuration, bounds
//! every call with the per-call timeout and drops the session after a
//! transport failure so the next call reconnects.

use super::{AiAdapter, ChunkStream, HealthStatus};
use crate::config::{RelayConfig, ServiceConfig};
use crate::connection::{ConnectionManager, Connector};
use crate::error_code::ErrorKind;
use crate::telemetry::{Observer, Sanitizer};
use crate::types::{AiResponse, QueryParams};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

/// A query with every parameter resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub query: String,
    pub deployment: String,
    pub context: HashMap<String, Value>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

/// Wire capability of one service, on top of its connection handling.
#[async_trait]
pub trait Backend: Connector {
    fn provider(&self) -> &str;

    async fn query(&self, session: &Self::Session, request: &BackendRequest) -> Result<AiResponse>;

    async fn stream(
        &self,
        session: Arc<Self::Session>,
        request: &BackendRequest,
    ) -> Result<ChunkStream>;

    /// Extra facts for [`HealthStatus::details`].
    fn health_details(&self) -> HashMap<String, Value> {
        HashMap::new()
    }
}

/// Defaults applied to parameters a caller leaves unset.
#[derive(Debug, Clone, PartialEq)]
pub struct CallDefaults {
    pub deployment: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub timeout: Duration,
}

impl From<&ServiceConfig> for CallDefaults {
    fn from(s: &ServiceConfig) -> Self {
        Self {
            deployment: s.deployment_name.clone(),
            max_tokens: s.max_tokens,
            temperature: s.temperature,
            timeout: s.timeout(),
        }
    }
}

pub struct ManagedAdapter<B: Backend> {
    connection: Arc<ConnectionManager<B>>,
    defaults: CallDefaults,
    sanitizer: Sanitizer,
}

impl<B: Backend> ManagedAdapter<B> {
    /// Wire `backend` to a fresh connection manager configured from `config`.
    pub fn new(backend: B, config: &RelayConfig) -> Self {
        let manager = ConnectionManager::new(
            backend,
            config.connection_policy(),
            config.service.timeout(),
        );
        Self::from_manager(Arc::new(manager), CallDefaults::from(&config.service))
    }

    pub fn with_observer(backend: B, config: &RelayConfig, observer: Arc<dyn Observer>) -> Self {
        let manager = ConnectionManager::new(
            backend,
            config.connection_policy(),
            config.service.timeout(),
        )
        .with_observer(observer);
        Self::from_manager(Arc::new(manager), CallDefaults::from(&config.service))
    }

    pub fn from_manager(connection: Arc<ConnectionManager<B>>, defaults: CallDefaults) -> Self {
        Self {
            connection,
            defaults,
            sanitizer: Sanitizer::new(),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<B>> {
        &self.connection
    }

    pub fn backend(&self) -> &B {
        self.connection.connector()
    }

    pub fn defaults(&self) -> &CallDefaults {
        &self.defaults
    }

    fn resolve(&self, query: &str, params: &QueryParams) -> BackendRequest {
        BackendRequest {
            query: query.to_string(),
            deployment: self.defaults.deployment.clone(),
            context: params.context.clone(),
            max_tokens: params.max_tokens.unwrap_or(self.defaults.max_tokens),
            temperature: params.temperature.unwrap_or(self.defaults.temperature),
            timeout: params.timeout.unwrap_or(self.defaults.timeout),
        }
    }

    fn call_timeout(timeout: Duration) -> Error {
        Error::timeout(
            format!("Request timeout after {}s", timeout.as_secs_f64()),
            Some(timeout),
        )
    }
}

#[async_trait]
impl<B: Backend> AiAdapter for ManagedAdapter<B> {
    fn provider(&self) -> &str {
        self.backend().provider()
    }

    async fn initialize(&self) -> Result<bool> {
        self.connection.connect_with_retry().await?;
        Ok(self.connection.check_connection().await)
    }

    async fn send_query(&self, query: &str, params: &QueryParams) -> Result<AiResponse> {
        let session = self.connection.ensure_connected().await?;
        let request = self.resolve(query, params);
        let started = Instant::now();

        let result = match tokio::time::timeout(
            request.timeout,
            self.backend().query(&session, &request),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(Self::call_timeout(request.timeout)),
        };

        match result {
            Ok(mut response) => {
                if response.response_time.is_none() {
                    response.response_time = Some(started.elapsed());
                }
                Ok(response)
            }
            Err(e) => {
                if e.kind() == ErrorKind::Connection {
                    self.connection.mark_unhealthy(&session).await;
                }
                Err(e)
            }
        }
    }

    async fn send_streaming_query(
        &self,
        query: &str,
        params: &QueryParams,
    ) -> Result<ChunkStream> {
        let session = self.connection.ensure_connected().await?;
        let request = self.resolve(query, params);

        let opened = match tokio::time::timeout(
            request.timeout,
            self.backend().stream(session.clone(), &request),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(Self::call_timeout(request.timeout)),
        };

        let stream = match opened {
            Ok(s) => s,
            Err(e) => {
                if e.kind() == ErrorKind::Connection {
                    self.connection.mark_unhealthy(&session).await;
                }
                return Err(e);
            }
        };

        let manager = self.connection.clone();
        Ok(stream
            .then(move |item| {
                let manager = manager.clone();
                let session = session.clone();
                async move {
                    if let Err(e) = &item {
                        if e.kind() == ErrorKind::Connection {
                            manager.mark_unhealthy(&session).await;
                        }
                    }
                    item
                }
            })
            .boxed())
    }

    async fn get_health_status(&self) -> HealthStatus {
        let healthy = self.connection.check_connection().await;
        let snapshot = self.connection.snapshot();

        let mut details = self.backend().health_details();
        details.insert(
            "timeout_secs".into(),
            Value::from(self.defaults.timeout.as_secs_f64()),
        );
        details.insert(
            "max_retries".into(),
            Value::from(self.connection.policy().max_retries),
        );

        HealthStatus {
            provider: self.provider().to_string(),
            endpoint: self.sanitizer.sanitize_endpoint(&snapshot.endpoint),
            healthy,
            connection_state: snapshot.state,
            connection_attempts: snapshot.connection_attempts,
            last_connection_time: snapshot
                .last_connection_time
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64()),
            details,
        }
    }

    async fn cleanup(&self) {
        self.connection.close_connection().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::types::StreamingChunk;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<BackendRequest>>,
        fail_with: Mutex<Option<Error>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Connector for Echo {
        type Session = ();

        fn endpoint(&self) -> &str {
            "https://user:pw@echo.test/v1?sig=abc"
        }

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self, _session: &()) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Backend for Echo {
        fn provider(&self) -> &str {
            "echo"
        }

        async fn query(&self, _session: &(), request: &BackendRequest) -> Result<AiResponse> {
            self.seen.lock().unwrap().push(request.clone());
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            if let Some(e) = self.fail_with.lock().unwrap().clone() {
                return Err(e);
            }
            Ok(AiResponse::success(request.query.to_uppercase()))
        }

        async fn stream(&self, _session: Arc<()>, request: &BackendRequest) -> Result<ChunkStream> {
            let words: Vec<String> = request.query.split(' ').map(str::to_string).collect();
            let n = words.len() as u64;
            let chunks = words
                .into_iter()
                .enumerate()
                .map(|(i, w)| Ok(StreamingChunk::new(w, i as u64)))
                .chain(std::iter::once(Ok(StreamingChunk::terminal(n))));
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    fn config() -> RelayConfig {
        let mut service =
            ServiceConfig::new("echo", "https://echo.test", "key", "echo-deployment");
        service.max_tokens = 123;
        service.timeout_secs = 5.0;
        RelayConfig::new(service)
    }

    #[tokio::test]
    async fn test_defaults_fill_unset_params() {
        let adapter = ManagedAdapter::new(Echo::default(), &config());
        let params = QueryParams {
            temperature: Some(0.2),
            ..Default::default()
        };
        let resp = adapter.send_query("hi", &params).await.unwrap();
        assert_eq!(resp.content, "HI");
        assert!(resp.response_time.is_some());

        let seen = adapter.backend().seen.lock().unwrap().clone();
        assert_eq!(seen[0].max_tokens, 123);
        assert_eq!(seen[0].temperature, 0.2);
        assert_eq!(seen[0].timeout, Duration::from_secs(5));
        assert_eq!(seen[0].deployment, "echo-deployment");
    }

    #[tokio::test]
    async fn test_query_connects_lazily() {
        let adapter = ManagedAdapter::new(Echo::default(), &config());
        assert_eq!(adapter.connection().state(), ConnectionState::Disconnected);
        adapter.send_query("x", &QueryParams::default()).await.unwrap();
        assert_eq!(adapter.connection().state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_timeout() {
        let adapter = ManagedAdapter::new(
            Echo {
                delay: Some(Duration::from_secs(60)),
                ..Default::default()
            },
            &config(),
        );
        let err = adapter
            .send_query("slow", &QueryParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_connection_error_drops_session() {
        let adapter = ManagedAdapter::new(Echo::default(), &config());
        adapter.initialize().await.unwrap();
        *adapter.backend().fail_with.lock().unwrap() = Some(Error::connection("reset"));
        let err = adapter.send_query("x", &QueryParams::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(adapter.connection().state(), ConnectionState::Disconnected);

        *adapter.backend().fail_with.lock().unwrap() = Some(Error::service("bad"));
        let _ = adapter.send_query("x", &QueryParams::default()).await;
        assert_eq!(adapter.connection().state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_streaming_passes_chunks_through() {
        let adapter = ManagedAdapter::new(Echo::default(), &config());
        let chunks: Vec<StreamingChunk> = adapter
            .send_streaming_query("a b", &QueryParams::default())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_complete);
    }

    #[tokio::test]
    async fn test_health_status_sanitizes_endpoint() {
        let adapter = ManagedAdapter::new(Echo::default(), &config());
        adapter.initialize().await.unwrap();
        let health = adapter.get_health_status().await;
        assert!(health.healthy);
        assert_eq!(health.provider, "echo");
        assert_eq!(health.endpoint, "https://echo.test/v1");
        assert_eq!(health.connection_state, ConnectionState::Connected);
        assert!(health.last_connection_time.is_some());
        assert_eq!(health.details["max_retries"], Value::from(3));

        adapter.cleanup().await;
        let health = adapter.get_health_status().await;
        assert!(!health.healthy);
        assert_eq!(health.connection_state, ConnectionState::Disconnected);
    }
}
