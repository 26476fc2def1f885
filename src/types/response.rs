//! Response values: whole responses and streamed chunks.

use crate::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Error message carried by responses that failed validation.
pub const VALIDATION_FAILED: &str = "Response validation failed";

/// Response from a single (non-streaming) query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<Duration>,
    #[serde(default)]
    pub retry_count: u32,
}

impl AiResponse {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            ..Default::default()
        }
    }

    /// Structured unsuccessful response for a classified error.
    pub fn failure(error: &Error, retry_count: u32) -> Self {
        Self {
            content: String::new(),
            success: false,
            error: Some(error.message()),
            error_type: Some(error.kind().name().to_string()),
            retry_count,
            ..Default::default()
        }
    }

    /// Unsuccessful response produced when the validator rejects a response.
    pub fn validation_failure(reason: impl Into<String>, retry_count: u32) -> Self {
        Self {
            content: String::new(),
            success: false,
            error: Some(VALIDATION_FAILED.to_string()),
            error_type: Some(crate::error_code::ErrorKind::Validation.name().to_string()),
            retry_count,
            ..Default::default()
        }
        .with_metadata("validation_reason", Value::String(reason.into()))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// One unit of incrementally produced content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingChunk {
    pub content: String,
    pub chunk_index: u64,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    #[serde(default = "timestamp")]
    pub timestamp: f64,
}

impl StreamingChunk {
    pub fn new(content: impl Into<String>, chunk_index: u64) -> Self {
        Self {
            content: content.into(),
            chunk_index,
            is_complete: false,
            metadata: HashMap::new(),
            timestamp: timestamp(),
        }
    }

    /// The empty terminal chunk.
    pub fn terminal(chunk_index: u64) -> Self {
        Self {
            is_complete: true,
            ..Self::new("", chunk_index)
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
