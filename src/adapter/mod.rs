//! 适配器模块：统一的 AI 后端能力接口及其通用的托管实现。
//!
//! # Adapter Module
//!
//! [`AiAdapter`] is the uniform capability every backend exposes to the
//! query layer. Most backends do not implement it directly: they implement
//! [`Backend`] and are wrapped in a [`ManagedAdapter`], which adds connection
//! lifecycle, per-call timeouts and configuration defaults.

pub mod managed;

pub use managed::{Backend, ManagedAdapter};

use crate::connection::ConnectionState;
use crate::types::{AiResponse, QueryParams, StreamingChunk};
use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Chunks produced by a streaming query. An `Err` item ends the stream.
pub type ChunkStream = BoxStream<'static, Result<StreamingChunk>>;

/// Health report of one adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub provider: String,
    /// Endpoint with query, fragment and credentials removed.
    pub endpoint: String,
    pub healthy: bool,
    pub connection_state: ConnectionState,
    pub connection_attempts: u32,
    /// Seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection_time: Option<f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

/// Query and streaming capability of one backend.
#[async_trait]
pub trait AiAdapter: Send + Sync {
    fn provider(&self) -> &str;

    /// Connect and verify the backend. `Ok(false)` means reachable but not usable.
    async fn initialize(&self) -> Result<bool>;

    async fn send_query(&self, query: &str, params: &QueryParams) -> Result<AiResponse>;

    async fn send_streaming_query(&self, query: &str, params: &QueryParams)
        -> Result<ChunkStream>;

    async fn get_health_status(&self) -> HealthStatus;

    async fn cleanup(&self);
}

#[async_trait]
impl<A: AiAdapter + ?Sized> AiAdapter for Arc<A> {
    fn provider(&self) -> &str {
        (**self).provider()
    }

    async fn initialize(&self) -> Result<bool> {
        (**self).initialize().await
    }

    async fn send_query(&self, query: &str, params: &QueryParams) -> Result<AiResponse> {
        (**self).send_query(query, params).await
    }

    async fn send_streaming_query(
        &self,
        query: &str,
        params: &QueryParams,
    ) -> Result<ChunkStream> {
        (**self).send_streaming_query(query, params).await
    }

    async fn get_health_status(&self) -> HealthStatus {
        (**self).get_health_status().await
    }

    async fn cleanup(&self) {
        (**self).cleanup().await
    }
}
