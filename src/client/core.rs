use crate::adapter::{AiAdapter, HealthStatus};
use crate::client::builder::RelayClientBuilder;
use crate::client::processor::{QueryProcessor, DROPPED_CHUNKS_KEY};
use crate::config::{BufferSettings, RelayConfig};
use crate::streaming::{
    self, spawn_auto_flush, AutoFlushHandle, ChunkEvent, ChunkSink, ResponseBuffer,
    StreamHandler, StreamTask,
};
use crate::telemetry::Observer;
use crate::types::{AiResponse, QueryRequest};
use crate::{Error, Result};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Entry point: resilient queries and buffered, interruptible streaming
/// over one adapter.
pub struct RelayClient {
    processor: QueryProcessor,
    streams: StreamHandler,
    buffer: BufferSettings,
    observer: Arc<dyn Observer>,
}

impl RelayClient {
    pub fn builder(config: RelayConfig) -> RelayClientBuilder {
        RelayClientBuilder::new(config)
    }

    pub(crate) fn new(
        processor: QueryProcessor,
        streams: StreamHandler,
        buffer: BufferSettings,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            processor,
            streams,
            buffer,
            observer,
        }
    }

    /// Connect and verify the adapter. `Ok(false)` means connected but unhealthy.
    pub async fn initialize(&self) -> Result<bool> {
        let ready = self.adapter().initialize().await?;
        info!(provider = self.adapter().provider(), ready, "Relay client initialized");
        Ok(ready)
    }

    /// Run a query through retry and validation.
    ///
    /// Never fails: exhausted retries and rejected responses come back as an
    /// unsuccessful [`AiResponse`].
    pub async fn ask(&self, request: QueryRequest) -> AiResponse {
        self.processor.answer(&request).await
    }

    /// Convenience for a query with default parameters.
    pub async fn ask_text(&self, query: &str) -> AiResponse {
        match QueryRequest::new(query) {
            Ok(request) => self.ask(request).await,
            Err(e) => AiResponse::failure(&e, 0),
        }
    }

    /// Stream a query's answer into `display`, coalesced by a [`ResponseBuffer`].
    ///
    /// `display` receives flushed text: by size, by the configured flush
    /// interval, and once more when the stream ends for any reason. Fails with
    /// [`Error::StreamActive`] while another stream is running.
    pub async fn ask_streaming<F>(&self, request: QueryRequest, display: F) -> Result<StreamTask>
    where
        F: FnMut(&str) + Send + 'static,
    {
        if self.streams.is_streaming() {
            return Err(Error::StreamActive {
                stream_id: self.streams.current_stream_id().unwrap_or_default(),
            });
        }

        let chunks = self.processor.process_streaming_query(&request).await?;

        let mut buffer =
            ResponseBuffer::from_settings(&self.buffer).with_observer(self.observer.clone());
        buffer.set_display_callback(display);
        let buffer = Arc::new(Mutex::new(buffer));
        let auto_flush = spawn_auto_flush(buffer.clone(), self.buffer.flush_interval());
        let sink = BufferedSink {
            buffer,
            auto_flush: Some(auto_flush),
        };

        // The running drop count rides on chunk metadata, which `contents` strips.
        let dropped = Arc::new(AtomicU64::new(0));
        let counter = dropped.clone();
        let chunks = chunks
            .inspect(move |item| {
                let count = item
                    .as_ref()
                    .ok()
                    .and_then(|chunk| chunk.metadata.get(DROPPED_CHUNKS_KEY))
                    .and_then(|v| v.as_u64());
                if let Some(count) = count {
                    counter.store(count, Ordering::SeqCst);
                }
            })
            .boxed();

        let task = self
            .streams
            .start_stream(streaming::contents(chunks), sink)?
            .with_dropped_counter(dropped);
        debug!(stream_id = task.stream_id(), "Streaming query started");
        Ok(task)
    }

    /// Interrupt the running stream, if any.
    pub fn interrupt(&self) -> bool {
        self.streams.interrupt_stream()
    }

    pub fn is_streaming(&self) -> bool {
        self.streams.is_streaming()
    }

    pub async fn health(&self) -> HealthStatus {
        self.adapter().get_health_status().await
    }

    /// Interrupt any stream and release the adapter's resources.
    pub async fn shutdown(&self) {
        if self.streams.interrupt_stream() {
            debug!("Interrupted active stream during shutdown");
        }
        self.adapter().cleanup().await;
        info!(provider = self.adapter().provider(), "Relay client shut down");
    }

    pub fn processor(&self) -> &QueryProcessor {
        &self.processor
    }

    pub fn stream_handler(&self) -> &StreamHandler {
        &self.streams
    }

    pub fn adapter(&self) -> &Arc<dyn AiAdapter> {
        self.processor.adapter()
    }
}

/// Feeds delivered chunks into a shared buffer; flushes when the stream ends.
struct BufferedSink {
    buffer: Arc<Mutex<ResponseBuffer>>,
    auto_flush: Option<AutoFlushHandle>,
}

impl BufferedSink {
    fn finish(&mut self) {
        // Dropping the handle stops the ticker.
        self.auto_flush.take();
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
    }
}

impl ChunkSink for BufferedSink {
    fn on_chunk(&mut self, chunk: &ChunkEvent) {
        if chunk.is_final {
            self.finish();
            return;
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_chunk(&chunk.content);
    }

    fn on_error(&mut self, _error: &Error) {
        self.finish();
    }
}

impl Drop for BufferedSink {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ChunkStream;
    use crate::config::ServiceConfig;
    use crate::connection::ConnectionState;
    use crate::types::{QueryParams, StreamingChunk};
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::collections::HashMap;

    struct Words(Vec<&'static str>);

    #[async_trait]
    impl AiAdapter for Words {
        fn provider(&self) -> &str {
            "words"
        }

        async fn initialize(&self) -> Result<bool> {
            Ok(true)
        }

        async fn send_query(&self, query: &str, _params: &QueryParams) -> Result<AiResponse> {
            Ok(AiResponse::success(query.to_uppercase()))
        }

        async fn send_streaming_query(
            &self,
            _query: &str,
            _params: &QueryParams,
        ) -> Result<ChunkStream> {
            let n = self.0.len() as u64;
            let mut items: Vec<Result<StreamingChunk>> = self
                .0
                .iter()
                .enumerate()
                .map(|(i, w)| Ok(StreamingChunk::new(*w, i as u64)))
                .collect();
            items.push(Ok(StreamingChunk::terminal(n)));
            Ok(futures::stream::iter(items).boxed())
        }

        async fn get_health_status(&self) -> HealthStatus {
            HealthStatus {
                provider: "words".into(),
                endpoint: "https://words.test".into(),
                healthy: true,
                connection_state: ConnectionState::Connected,
                connection_attempts: 1,
                last_connection_time: None,
                details: HashMap::new(),
            }
        }

        async fn cleanup(&self) {}
    }

    fn client(words: Vec<&'static str>, buffer_size: usize) -> RelayClient {
        let mut config = RelayConfig::new(ServiceConfig::new(
            "test",
            "https://words.test",
            "key",
            "model",
        ));
        config.buffer.buffer_size = buffer_size;
        RelayClient::builder(config)
            .with_logging(false)
            .build_with_adapter(Arc::new(Words(words)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ask_returns_response() {
        let client = client(vec![], 100);
        let resp = client.ask_text("hello").await;
        assert!(resp.success);
        assert_eq!(resp.content, "HELLO");
    }

    #[tokio::test]
    async fn test_ask_text_rejects_blank() {
        let client = client(vec![], 100);
        let resp = client.ask_text("  ").await;
        assert!(!resp.success);
        assert_eq!(resp.error_type.as_deref(), Some("validation_error"));
    }

    #[tokio::test]
    async fn test_streaming_flushes_everything_at_end() {
        let client = client(vec!["Hello", ", ", "world"], 1000);
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let task = client
            .ask_streaming(QueryRequest::new("q").unwrap(), move |text: &str| {
                sink.lock().unwrap().push(text.to_string())
            })
            .await
            .unwrap();
        let outcome = task.wait().await;
        assert!(outcome.is_success());
        assert_eq!(seen.lock().unwrap().concat(), "Hello, world");
        assert!(!client.is_streaming());
    }

    #[tokio::test]
    async fn test_streaming_flushes_by_size() {
        let client = client(vec!["aaaa", "bbbb", "cc"], 4);
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let task = client
            .ask_streaming(QueryRequest::new("q").unwrap(), move |text: &str| {
                sink.lock().unwrap().push(text.to_string())
            })
            .await
            .unwrap();
        task.wait().await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["aaaa", "bbbb", "cc"]);
    }
}
