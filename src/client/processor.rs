//! Query processor
//!
//! Runs one logical query through an adapter under the query-level retry
//! budget and validates what comes back. This budget is independent of the
//! connection budget: connection failures were already retried inside the
//! adapter's connection manager before they reach this loop.

use super::validation::ResponseValidator;
use crate::adapter::{AiAdapter, ChunkStream};
use crate::error_code::ErrorKind;
use crate::resilience::RetryPolicy;
use crate::telemetry::{noop_observer, Observer, RelayEvent};
use crate::types::{AiResponse, QueryRequest, StreamingChunk};
use crate::{Error, Result};
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Metadata key carrying the running count of dropped stream chunks.
pub const DROPPED_CHUNKS_KEY: &str = "dropped_chunks";

pub struct QueryProcessor {
    adapter: Arc<dyn AiAdapter>,
    policy: RetryPolicy,
    validator: ResponseValidator,
    observer: Arc<dyn Observer>,
}

impl QueryProcessor {
    pub fn new(adapter: Arc<dyn AiAdapter>) -> Self {
        Self {
            adapter,
            policy: RetryPolicy::default(),
            validator: ResponseValidator::default(),
            observer: noop_observer(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn AiAdapter> {
        &self.adapter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn validator(&self) -> &ResponseValidator {
        &self.validator
    }

    /// Send the query, retrying whitelisted failures.
    ///
    /// A response that fails validation comes back as an unsuccessful
    /// response (never retried, never an error). Once the budget is spent the
    /// last error is returned unchanged.
    pub async fn process_query(&self, request: &QueryRequest) -> Result<AiResponse> {
        self.run(request).await.map_err(|(e, _)| e)
    }

    /// Like [`process_query`](Self::process_query), but an error becomes an
    /// unsuccessful response carrying its classification.
    pub async fn answer(&self, request: &QueryRequest) -> AiResponse {
        match self.run(request).await {
            Ok(response) => response,
            Err((e, attempt)) => AiResponse::failure(&e, attempt),
        }
    }

    async fn run(&self, request: &QueryRequest) -> std::result::Result<AiResponse, (Error, u32)> {
        request.validate().map_err(|e| (e, 0))?;
        let params = request.params();
        let max_attempts = self.policy.max_attempts();
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            debug!(attempt = attempt + 1, max_attempts, "Processing query attempt");

            match self.adapter.send_query(&request.query, &params).await {
                Ok(mut response) => {
                    if let Err(rejected) = self.validator.validate_response(&response) {
                        let reason = match rejected.context().and_then(|c| c.details.as_deref()) {
                            Some(details) => format!("{}: {}", rejected.message(), details),
                            None => rejected.message(),
                        };
                        warn!(
                            attempt = attempt + 1,
                            reason = %reason,
                            "Response validation failed"
                        );
                        self.completed(false, attempt, started, Some(ErrorKind::Validation));
                        return Ok(AiResponse::validation_failure(reason, attempt));
                    }
                    response.retry_count = attempt;
                    self.completed(true, attempt, started, None);
                    info!(
                        attempt = attempt + 1,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Query completed"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    let retry = self.policy.should_retry(&err, attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts,
                        error_type = err.kind().name(),
                        should_retry = retry,
                        error = %err,
                        "Query attempt failed"
                    );
                    if !retry {
                        error!(
                            attempts = attempt + 1,
                            error_type = err.kind().name(),
                            "Query failed"
                        );
                        self.completed(false, attempt, started, Some(err.kind()));
                        return Err((err, attempt));
                    }
                    let delay = self.policy.delay_for(&err, attempt);
                    self.observer.observe(&RelayEvent::QueryRetry {
                        attempt: attempt + 1,
                        delay,
                        error_type: err.kind(),
                    });
                    info!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying query"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn completed(
        &self,
        success: bool,
        attempt: u32,
        started: Instant,
        error_type: Option<ErrorKind>,
    ) {
        self.observer.observe(&RelayEvent::QueryCompleted {
            success,
            retry_count: attempt,
            elapsed: started.elapsed(),
            error_type,
        });
    }

    /// Open a streaming query and forward only chunks that pass validation.
    ///
    /// Opening the stream, up to and including its first item, is retried
    /// under the retry policy. After that nothing is retried: an error item is
    /// yielded once and ends the stream, and chunks already yielded stay
    /// delivered. Dropped chunks are counted; every later forwarded chunk
    /// carries the running count under [`DROPPED_CHUNKS_KEY`].
    pub async fn process_streaming_query(&self, request: &QueryRequest) -> Result<ChunkStream> {
        request.validate()?;
        let params = request.params();
        let max_attempts = self.policy.max_attempts();
        let mut attempt: u32 = 0;

        let (stream, first) = loop {
            debug!(attempt = attempt + 1, max_attempts, "Opening stream");
            let failure = match self.adapter.send_streaming_query(&request.query, &params).await {
                Ok(mut stream) => {
                    let first = stream.next().await;
                    match first {
                        Some(Err(e)) => e,
                        first => break (stream, first),
                    }
                }
                Err(e) => e,
            };

            if !self.policy.should_retry(&failure, attempt) {
                error!(
                    attempts = attempt + 1,
                    error_type = failure.kind().name(),
                    error = %failure,
                    "Streaming query failed"
                );
                return Err(failure);
            }
            let delay = self.policy.delay_for(&failure, attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error_type = failure.kind().name(),
                error = %failure,
                "Opening stream failed, retrying"
            );
            self.observer.observe(&RelayEvent::QueryRetry {
                attempt: attempt + 1,
                delay,
                error_type: failure.kind(),
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        };

        // An empty source has already ended; it must not be polled again.
        let done = first.is_none();
        let state = Forward {
            inner: stream,
            first,
            validator: self.validator.clone(),
            observer: self.observer.clone(),
            dropped: 0,
            done,
        };
        Ok(futures::stream::unfold(state, Forward::next).boxed())
    }
}

struct Forward {
    inner: ChunkStream,
    /// First item, already pulled while opening. `None` once handed out.
    first: Option<Result<StreamingChunk>>,
    validator: ResponseValidator,
    observer: Arc<dyn Observer>,
    dropped: u64,
    done: bool,
}

impl Forward {
    async fn next(mut self) -> Option<(Result<StreamingChunk>, Self)> {
        if self.done {
            return None;
        }
        loop {
            let item = match self.first.take() {
                Some(item) => item,
                None => match self.inner.next().await {
                    Some(item) => item,
                    None => {
                        self.done = true;
                        return None;
                    }
                },
            };
            match item {
                Err(e) => {
                    error!(error_type = e.kind().name(), error = %e, "Stream failed mid-way");
                    self.done = true;
                    return Some((Err(e), self));
                }
                Ok(chunk) => match self.validator.validate_chunk(&chunk) {
                    Ok(()) => {
                        let chunk = if self.dropped > 0 {
                            chunk.with_metadata(DROPPED_CHUNKS_KEY, Value::from(self.dropped))
                        } else {
                            chunk
                        };
                        if chunk.is_complete {
                            self.done = true;
                        }
                        return Some((Ok(chunk), self));
                    }
                    Err(reason) => {
                        self.dropped += 1;
                        warn!(
                            chunk_index = chunk.chunk_index,
                            dropped_total = self.dropped,
                            reason = %reason,
                            "Dropping invalid chunk"
                        );
                        self.observer.observe(&RelayEvent::ChunkDropped {
                            chunk_index: chunk.chunk_index,
                            reason: reason.message(),
                            dropped_total: self.dropped,
                        });
                    }
                },
            }
        }
    }
}
