//! # ai-relay
//!
//! 面向远程 AI 服务的弹性客户端层：连接管理、重试、响应校验与可中断的流式输出。
//!
//! A resilient client layer for invoking a remote AI backend. It hides
//! transient failures behind connection management and retry with
//! exponential backoff, validates every response, and delivers streamed
//! output chunk by chunk with cooperative interruption and display-side
//! buffering.
//!
//! ## Overview
//!
//! A query flows through the layers like this:
//!
//! ```text
//! RelayClient ─► QueryProcessor ─► AiAdapter ─► ConnectionManager ─► Backend
//!      │              (retry,        (timeouts,    (connect/probe/
//!      │             validation)    reconnection)   backoff)
//!      └─► StreamHandler ─► ResponseBuffer ─► display callback
//! ```
//!
//! Two retry budgets are independent: connection failures are retried inside
//! the [`ConnectionManager`] before a query attempt sees them, and the
//! [`QueryProcessor`] retries whole attempts on whitelisted error kinds.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_relay::{QueryRequest, RelayClient, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> ai_relay::Result<()> {
//!     let config = RelayConfig::from_env()?;
//!     let client = RelayClient::builder(config).build()?;
//!     client.initialize().await?;
//!
//!     let answer = client.ask(QueryRequest::new("Summarize this diff")?).await;
//!     println!("{}", answer.content);
//!
//!     let task = client
//!         .ask_streaming(QueryRequest::new("Explain it step by step")?, |text: &str| {
//!             print!("{}", text)
//!         })
//!         .await?;
//!     task.wait().await;
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapter`] | Adapter capability and the connection-managed adapter |
//! | [`backend`] | Concrete backends (HTTP/JSON over `reqwest`) |
//! | [`client`] | Relay client, builder, query processor and validation |
//! | [`config`] | YAML / environment configuration |
//! | [`connection`] | Connection lifecycle with retry and health probes |
//! | [`resilience`] | Retry policies and exponential backoff |
//! | [`streaming`] | Stream handler and response buffer |
//! | [`telemetry`] | Observer events, sanitization and the logging adapter |
//! | [`types`] | Requests, responses and streaming chunks |

pub mod adapter;
#[cfg(feature = "http")]
pub mod backend;
pub mod client;
pub mod config;
pub mod connection;
pub mod error_code;
pub mod resilience;
pub mod streaming;
pub mod telemetry;
pub mod types;

// Re-export main types for convenience
pub use adapter::managed::{Backend, BackendRequest, ManagedAdapter};
pub use adapter::{AiAdapter, ChunkStream, HealthStatus};
#[cfg(feature = "http")]
pub use backend::HttpBackend;
pub use client::{QueryProcessor, RelayClient, RelayClientBuilder, ResponseValidator};
pub use config::{RelayConfig, ServiceConfig};
pub use connection::{ConnectionManager, ConnectionState, Connector};
pub use error_code::ErrorKind;
pub use resilience::RetryPolicy;
pub use streaming::{ResponseBuffer, StreamHandler, StreamOutcome, StreamState, StreamTask};
pub use telemetry::{Observer, RelayEvent};
pub use types::{AiResponse, QueryParams, QueryRequest, StreamingChunk};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
