//! Query request and the per-call parameters handed to adapters.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// One logical query issued by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl QueryRequest {
    /// Create a request; rejects empty or whitespace-only queries.
    pub fn new(query: impl Into<String>) -> Result<Self> {
        let request = Self {
            query: query.into(),
            context: HashMap::new(),
            max_tokens: None,
            temperature: None,
            timeout: None,
        };
        request.validate()?;
        Ok(request)
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn temperature(mut self, temp: f64) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::validation_with_context(
                "Query cannot be empty",
                ErrorContext::new()
                    .with_field_path("request.query")
                    .with_source("query_request"),
            ));
        }
        Ok(())
    }

    /// Parameters forwarded to the adapter; the query text travels separately.
    pub fn params(&self) -> QueryParams {
        QueryParams {
            context: self.context.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            timeout: self.timeout,
        }
    }
}

/// Per-call overrides an adapter receives next to the query text.
///
/// `None` means "use the adapter's configured default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl QueryParams {
    /// Only the fields that are actually set, as a JSON object (for logging).
    pub fn to_json(&self) -> serde_json::Map<String, Value> {
        let mut out = serde_json::Map::new();
        if !self.context.is_empty() {
            out.insert(
                "context".into(),
                Value::Object(self.context.clone().into_iter().collect()),
            );
        }
        if let Some(m) = self.max_tokens {
            out.insert("max_tokens".into(), Value::from(m));
        }
        if let Some(t) = self.temperature {
            out.insert("temperature".into(), Value::from(t));
        }
        if let Some(t) = self.timeout {
            out.insert("timeout".into(), Value::from(t.as_secs_f64()));
        }
        out
    }
}
