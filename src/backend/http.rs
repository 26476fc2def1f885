//! HTTP/JSON backend over `reqwest`.
//!
//! | Call | Request | Success response |
//! |------|---------|------------------|
//! | health | `GET {endpoint}/health` | any 2xx |
//! | query | `POST {endpoint}/v1/query` | `{"content": "...", "metadata": {...}}` |
//! | stream | same body with `"stream": true` | SSE frames `data: {"content": "..."}`, ended by `data: [DONE]` |
//!
//! Every request carries `Authorization: Bearer <api_key>` and an
//! `api-version` query parameter. A session is one `reqwest::Client`, so a
//! reconnect starts from a fresh connection pool.
//!
//! Non-2xx statuses map onto the error taxonomy: 429 is a rate limit
//! (honoring `Retry-After` in seconds), 408/504 a timeout, 502/503 a
//! connection error, 400/422 a validation error, anything else a service
//! error carrying the status code.

use crate::adapter::managed::{Backend, BackendRequest};
use crate::adapter::ChunkStream;
use crate::config::ServiceConfig;
use crate::connection::Connector;
use crate::error_code::ErrorKind;
use crate::types::{AiResponse, StreamingChunk};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub const DEFAULT_QUERY_PATH: &str = "/v1/query";
pub const DEFAULT_HEALTH_PATH: &str = "/health";

const DONE_SIGNAL: &str = "[DONE]";
const FRAME_DELIMITER: &[u8] = b"\n\n";
const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Clone)]
pub struct HttpBackend {
    provider: String,
    endpoint: String,
    api_key: String,
    api_version: String,
    timeout: Duration,
    query_path: String,
    health_path: String,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("api_key", &"***REDACTED***")
            .field("api_version", &self.api_version)
            .field("query_path", &self.query_path)
            .field("health_path", &self.health_path)
            .finish()
    }
}

impl HttpBackend {
    pub fn from_config(service: &ServiceConfig) -> Result<Self> {
        url::Url::parse(&service.endpoint).map_err(|e| {
            Error::configuration_with_context(
                "Invalid endpoint URL",
                ErrorContext::new()
                    .with_field_path("service.endpoint")
                    .with_details(e.to_string())
                    .with_source("http_backend"),
            )
        })?;
        Ok(Self {
            provider: service.provider.clone(),
            endpoint: service.endpoint.trim_end_matches('/').to_string(),
            api_key: service.api_key.clone(),
            api_version: service.api_version.clone(),
            timeout: service.timeout(),
            query_path: DEFAULT_QUERY_PATH.to_string(),
            health_path: DEFAULT_HEALTH_PATH.to_string(),
        })
    }

    pub fn with_query_path(mut self, path: impl Into<String>) -> Self {
        self.query_path = path.into();
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let max_idle = std::env::var("AI_HTTP_POOL_MAX_IDLE_PER_HOST")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(32);
        reqwest::Client::builder()
            .connect_timeout(self.timeout)
            .pool_max_idle_per_host(max_idle)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .map_err(|e| {
                Error::connection_to(format!("failed to build HTTP client: {}", e), &self.endpoint)
            })
    }

    fn body(&self, request: &BackendRequest, stream: bool) -> Value {
        json!({
            "query": request.query,
            "deployment": request.deployment,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "context": request.context,
            "stream": stream,
        })
    }

    async fn probe(&self, client: &reqwest::Client) -> Result<()> {
        let resp = client
            .get(self.url(&self.health_path))
            .bearer_auth(&self.api_key)
            .query(&[("api-version", &self.api_version)])
            .timeout(self.timeout)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl Connector for HttpBackend {
    type Session = reqwest::Client;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> Result<reqwest::Client> {
        let client = self.build_client()?;
        self.probe(&client).await?;
        debug!(endpoint = %self.endpoint, "HTTP session established");
        Ok(client)
    }

    async fn health_check(&self, session: &reqwest::Client) -> Result<()> {
        self.probe(session).await
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn query(
        &self,
        session: &reqwest::Client,
        request: &BackendRequest,
    ) -> Result<AiResponse> {
        let resp = session
            .post(self.url(&self.query_path))
            .bearer_auth(&self.api_key)
            .query(&[("api-version", &self.api_version)])
            .timeout(request.timeout)
            .json(&self.body(request, false))
            .send()
            .await?;
        let reply: Reply = check_status(resp).await?.json().await?;
        let mut response = AiResponse::success(reply.content);
        response.metadata = reply.metadata;
        Ok(response)
    }

    async fn stream(
        &self,
        session: Arc<reqwest::Client>,
        request: &BackendRequest,
    ) -> Result<ChunkStream> {
        let resp = session
            .post(self.url(&self.query_path))
            .bearer_auth(&self.api_key)
            .query(&[("api-version", &self.api_version)])
            .header(ACCEPT, "text/event-stream")
            .json(&self.body(request, true))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let bytes = resp.bytes_stream().map_err(Error::from).boxed();
        Ok(sse_chunks(bytes))
    }

    fn health_details(&self) -> HashMap<String, Value> {
        HashMap::from([
            ("api_version".to_string(), json!(self.api_version)),
            ("query_path".to_string(), json!(self.query_path)),
            ("health_path".to_string(), json!(self.health_path)),
        ])
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    content: String,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = parse_retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), &body, retry_after))
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs = headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Classify a non-2xx status.
pub fn status_error(status: u16, body: &str, retry_after: Option<Duration>) -> Error {
    let body = body.trim();
    let message = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
        format!("HTTP {}: {}", status, preview)
    };
    match ErrorKind::from_http_status(status) {
        ErrorKind::RateLimit => Error::rate_limited(message, retry_after),
        ErrorKind::Timeout => Error::timeout(message, None),
        ErrorKind::Connection => Error::connection(message),
        ErrorKind::Validation => Error::validation_with_context(
            message,
            ErrorContext::new()
                .with_details(format!("status {}", status))
                .with_source("http_backend"),
        ),
        _ => Error::service_with_code(message, status.to_string()),
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::timeout(format!("HTTP request timed out: {}", e), None)
        } else if e.is_connect() || e.is_request() || e.is_body() {
            Error::connection(format!("HTTP transport failed: {}", e))
        } else if let Some(status) = e.status() {
            status_error(status.as_u16(), "", None)
        } else if e.is_decode() {
            Error::service(format!("invalid response body: {}", e))
        } else {
            Error::service(e.to_string())
        }
    }
}

enum Frame {
    Content(Reply),
    Done,
    Skip,
}

fn parse_frame(frame: &[u8]) -> Result<Frame> {
    let text = String::from_utf8_lossy(frame);
    let mut data: Vec<&str> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(payload) = line.strip_prefix("data:") {
            data.push(payload.trim_start());
        } else if line.starts_with('{') {
            data.push(line);
        }
    }
    if data.is_empty() {
        return Ok(Frame::Skip);
    }
    let payload = data.join("\n");
    if payload.trim() == DONE_SIGNAL {
        return Ok(Frame::Done);
    }
    serde_json::from_str::<Reply>(&payload)
        .map(Frame::Content)
        .map_err(|e| Error::service(format!("invalid stream frame: {}", e)))
}

struct SseState {
    input: BoxStream<'static, Result<Bytes>>,
    buf: Vec<u8>,
    index: u64,
    eof: bool,
}

impl SseState {
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        let at = self
            .buf
            .windows(FRAME_DELIMITER.len())
            .position(|w| w == FRAME_DELIMITER)?;
        let frame = self.buf[..at].to_vec();
        self.buf.drain(..at + FRAME_DELIMITER.len());
        Some(frame)
    }
}

/// Decode an SSE byte stream into numbered chunks.
///
/// Always ends with an empty terminal chunk, unless a transport or frame
/// error ends it first.
pub fn sse_chunks(input: BoxStream<'static, Result<Bytes>>) -> ChunkStream {
    let state = SseState {
        input,
        buf: Vec::new(),
        index: 0,
        eof: false,
    };
    stream::unfold(Some(state), |state| async move {
        let mut st = state?;
        loop {
            if let Some(frame) = st.next_frame() {
                match parse_frame(&frame) {
                    Ok(Frame::Content(reply)) => {
                        let mut chunk = StreamingChunk::new(reply.content, st.index);
                        chunk.metadata = reply.metadata;
                        trace!(chunk_index = st.index, "SSE frame decoded");
                        st.index += 1;
                        return Some((Ok(chunk), Some(st)));
                    }
                    Ok(Frame::Done) => {
                        return Some((Ok(StreamingChunk::terminal(st.index)), None));
                    }
                    Ok(Frame::Skip) => continue,
                    Err(e) => return Some((Err(e), None)),
                }
            }
            if st.eof {
                return Some((Ok(StreamingChunk::terminal(st.index)), None));
            }
            match st.input.next().await {
                Some(Ok(bytes)) => st.buf.extend_from_slice(&bytes),
                Some(Err(e)) => return Some((Err(e), None)),
                None => {
                    st.eof = true;
                    if !st.buf.is_empty() {
                        st.buf.extend_from_slice(FRAME_DELIMITER);
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(parts: &[&'static str]) -> BoxStream<'static, Result<Bytes>> {
        let items: Vec<Result<Bytes>> = parts.iter().map(|p| Ok(Bytes::from(*p))).collect();
        stream::iter(items).boxed()
    }

    async fn decode(parts: &[&'static str]) -> Vec<Result<StreamingChunk>> {
        sse_chunks(bytes(parts)).collect().await
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let chunks = decode(&[
            "data: {\"content\":\"Hel",
            "lo\"}\n\ndata: {\"content\":\" there\"}\n",
            "\n: keep-alive\n\ndata: [DONE]\n\n",
        ])
        .await;
        let chunks: Vec<StreamingChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content, "Hello");
        assert_eq!(chunks[1].content, " there");
        assert_eq!(chunks[1].chunk_index, 1);
        assert!(chunks[2].is_complete);
        assert_eq!(chunks[2].chunk_index, 2);
    }

    #[tokio::test]
    async fn test_eof_without_done_still_terminates() {
        let chunks = decode(&["data: {\"content\":\"x\"}"]).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap().content, "x");
        assert!(chunks[1].as_ref().unwrap().is_complete);
    }

    #[tokio::test]
    async fn test_multibyte_split_is_reassembled() {
        let frame = "data: {\"content\":\"é\"}\n\n".as_bytes();
        let cut = frame.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let head = Bytes::copy_from_slice(&frame[..cut]);
        let tail = Bytes::copy_from_slice(&frame[cut..]);
        let input = stream::iter(vec![Ok(head), Ok(tail)]).boxed();
        let chunks: Vec<_> = sse_chunks(input).collect().await;
        assert_eq!(chunks[0].as_ref().unwrap().content, "é");
    }

    #[tokio::test]
    async fn test_bad_frame_ends_stream_with_error() {
        let chunks = decode(&["data: {not json}\n\ndata: {\"content\":\"late\"}\n\n"]).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap_err().kind(), ErrorKind::Service);
    }

    #[test]
    fn test_status_classification() {
        let e = status_error(429, "slow down", Some(Duration::from_secs(7)));
        assert_eq!(e.kind(), ErrorKind::RateLimit);
        assert_eq!(e.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(e.message(), "HTTP 429: slow down");

        assert_eq!(status_error(504, "", None).kind(), ErrorKind::Timeout);
        assert_eq!(status_error(503, "", None).kind(), ErrorKind::Connection);
        assert_eq!(status_error(422, "", None).kind(), ErrorKind::Validation);
        assert_eq!(status_error(401, "", None).kind(), ErrorKind::Service);
    }

    #[test]
    fn test_retry_after_header() {
        fn headers(value: &str) -> HeaderMap {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, value.parse().unwrap());
            headers
        }
        assert_eq!(parse_retry_after(&headers("7")), Some(Duration::from_secs(7)));
        assert_eq!(
            parse_retry_after(&headers(" 1.5 ")),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_retry_after(&headers("1e300")), None);
        assert_eq!(parse_retry_after(&headers("-3")), None);
        assert_eq!(parse_retry_after(&headers("NaN")), None);
        assert_eq!(parse_retry_after(&headers("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_debug_hides_key() {
        let backend = HttpBackend::from_config(&ServiceConfig::new(
            "azure_openai",
            "https://example.test/",
            "sk-secret",
            "gpt",
        ))
        .unwrap();
        let printed = format!("{:?}", backend);
        assert!(!printed.contains("sk-secret"));
        assert_eq!(backend.endpoint(), "https://example.test");
    }
}
