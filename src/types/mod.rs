//! 类型模块：请求、响应与流式分块等按调用创建的不可变值。
//!
//! # Types Module
//!
//! Per-call values exchanged between the caller, the query processor and
//! adapters.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`QueryRequest`] | Query text plus optional per-call overrides |
//! | [`QueryParams`] | What an adapter receives next to the query text |
//! | [`AiResponse`] | Whole response, successful or structured failure |
//! | [`StreamingChunk`] | One incrementally produced unit of content |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay::types::{AiResponse, QueryRequest};
//!
//! let request = QueryRequest::new("Explain this function")
//!     .unwrap()
//!     .max_tokens(256);
//! assert_eq!(request.params().max_tokens, Some(256));
//!
//! let response = AiResponse::success("It adds two numbers.");
//! assert!(response.success);
//! ```

pub mod request;
pub mod response;

pub use request::{QueryParams, QueryRequest};
pub use response::{AiResponse, StreamingChunk, VALIDATION_FAILED};
