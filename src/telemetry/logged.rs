//! Logging wrapper for any [`AiAdapter`].
//!
//! Forwards every call unchanged. Around each one it logs a sanitized
//! request/response preview with timings and records per-operation metrics.

use super::Sanitizer;
use crate::adapter::{AiAdapter, ChunkStream, HealthStatus};
use crate::types::{AiResponse, QueryParams};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Counters for one adapter operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

impl OperationMetrics {
    pub fn average_duration(&self) -> Duration {
        if self.calls == 0 {
            return Duration::ZERO;
        }
        self.total_duration / u32::try_from(self.calls).unwrap_or(u32::MAX)
    }
}

type MetricsTable = Arc<Mutex<HashMap<&'static str, OperationMetrics>>>;

pub struct LoggedAdapter<A: AiAdapter> {
    inner: A,
    sanitizer: Sanitizer,
    metrics: MetricsTable,
}

impl<A: AiAdapter> LoggedAdapter<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            sanitizer: Sanitizer::new(),
            metrics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// Snapshot of the metrics recorded so far, keyed by operation name.
    pub fn metrics(&self) -> HashMap<String, OperationMetrics> {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn record(&self, operation: &'static str, elapsed: Duration, ok: bool) {
        record(&self.metrics, operation, elapsed, ok);
    }

    fn params_preview(&self, params: &QueryParams) -> Value {
        self.sanitizer.sanitize_value(&Value::Object(params.to_json()))
    }
}

fn record(table: &MetricsTable, operation: &'static str, elapsed: Duration, ok: bool) {
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    let m = table.entry(operation).or_default();
    m.calls += 1;
    if !ok {
        m.failures += 1;
    }
    m.total_duration += elapsed;
    m.max_duration = m.max_duration.max(elapsed);
}

#[async_trait]
impl<A: AiAdapter> AiAdapter for LoggedAdapter<A> {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    async fn initialize(&self) -> Result<bool> {
        let started = Instant::now();
        let result = self.inner.initialize().await;
        let elapsed = started.elapsed();
        match &result {
            Ok(ready) => info!(
                provider = self.provider(),
                ready,
                elapsed_ms = elapsed.as_millis() as u64,
                "Adapter initialized"
            ),
            Err(e) => warn!(
                provider = self.provider(),
                error_type = e.kind().name(),
                error = %self.sanitizer.sanitize_text(&e.to_string()),
                "Adapter initialization failed"
            ),
        }
        self.record("initialize", elapsed, matches!(result, Ok(true)));
        result
    }

    async fn send_query(&self, query: &str, params: &QueryParams) -> Result<AiResponse> {
        debug!(
            provider = self.provider(),
            query = %self.sanitizer.sanitize_content(query),
            params = %self.params_preview(params),
            "Sending query"
        );
        let started = Instant::now();
        let result = self.inner.send_query(query, params).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(response) => info!(
                provider = self.provider(),
                success = response.success,
                content_length = response.content.len(),
                content = %self.sanitizer.sanitize_content(&response.content),
                elapsed_ms = elapsed.as_millis() as u64,
                "Query response"
            ),
            Err(e) => warn!(
                provider = self.provider(),
                error_type = e.kind().name(),
                error = %self.sanitizer.sanitize_text(&e.to_string()),
                elapsed_ms = elapsed.as_millis() as u64,
                "Query failed"
            ),
        }
        self.record(
            "send_query",
            elapsed,
            result.as_ref().map(|r| r.success).unwrap_or(false),
        );
        result
    }

    async fn send_streaming_query(
        &self,
        query: &str,
        params: &QueryParams,
    ) -> Result<ChunkStream> {
        debug!(
            provider = self.provider(),
            query = %self.sanitizer.sanitize_content(query),
            params = %self.params_preview(params),
            "Opening stream"
        );
        let started = Instant::now();
        let result = self.inner.send_streaming_query(query, params).await;
        let opened_in = started.elapsed();

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    provider = self.provider(),
                    error_type = e.kind().name(),
                    error = %self.sanitizer.sanitize_text(&e.to_string()),
                    "Opening stream failed"
                );
                self.record("send_streaming_query", opened_in, false);
                return Err(e);
            }
        };

        // The operation is recorded when the stream ends, so its duration
        // covers the whole delivery.
        let metrics = self.metrics.clone();
        let sanitizer = self.sanitizer.clone();
        let mut chunks: u64 = 0;
        let mut characters: usize = 0;
        let mut failed = false;
        let mut done = false;
        let tracked = stream.inspect(move |item| {
            if done {
                return;
            }
            match item {
                Ok(chunk) => {
                    chunks += 1;
                    characters += chunk.content.len();
                    debug!(
                        chunk_index = chunk.chunk_index,
                        content = %sanitizer.sanitize_content(&chunk.content),
                        "Stream chunk"
                    );
                    if chunk.is_complete {
                        done = true;
                    }
                }
                Err(e) => {
                    failed = true;
                    done = true;
                    warn!(
                        error_type = e.kind().name(),
                        error = %sanitizer.sanitize_text(&e.to_string()),
                        "Stream failed"
                    );
                }
            }
            if done {
                let elapsed = started.elapsed();
                info!(
                    chunks,
                    characters,
                    failed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Stream finished"
                );
                record(&metrics, "send_streaming_query", elapsed, !failed);
            }
        });
        Ok(tracked.boxed())
    }

    async fn get_health_status(&self) -> HealthStatus {
        let started = Instant::now();
        let status = self.inner.get_health_status().await;
        let elapsed = started.elapsed();
        debug!(
            provider = %status.provider,
            endpoint = %status.endpoint,
            healthy = status.healthy,
            state = %status.connection_state,
            "Health status"
        );
        self.record("get_health_status", elapsed, status.healthy);
        status
    }

    async fn cleanup(&self) {
        let started = Instant::now();
        self.inner.cleanup().await;
        info!(provider = self.provider(), "Adapter cleaned up");
        self.record("cleanup", started.elapsed(), true);
    }
}
