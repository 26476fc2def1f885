//! 客户端层：查询处理、响应校验与流式输出。
//!
//! Client layer for the relay.
//!
//! [`RelayClient`] is the entry point. It is assembled by
//! [`RelayClientBuilder`] from a [`RelayConfig`](crate::config::RelayConfig)
//! and an adapter, and delegates to the pieces below:
//!
//! - [`QueryProcessor`]: retry loop plus response validation
//! - [`ResponseValidator`]: content rules for responses and streamed chunks
//! - [`StreamHandler`](crate::streaming::StreamHandler): one interruptible stream at a time

pub mod builder;
pub mod core;
pub mod processor;
pub mod validation;

pub use builder::RelayClientBuilder;
pub use core::RelayClient;
pub use processor::{QueryProcessor, DROPPED_CHUNKS_KEY};
pub use validation::ResponseValidator;
