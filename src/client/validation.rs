//! 响应校验：成功标志、非空内容与最大长度规则。
//!
//! Response validation.

use crate::types::{AiResponse, StreamingChunk};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};

/// Rules applied to every response and streamed chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseValidator {
    pub allow_empty_content: bool,
    /// Maximum content length in characters.
    pub max_content_length: Option<usize>,
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self {
            allow_empty_content: true,
            max_content_length: None,
        }
    }
}

impl ResponseValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject responses whose content is empty or whitespace only.
    pub fn require_content(mut self) -> Self {
        self.allow_empty_content = false;
        self
    }

    pub fn with_max_content_length(mut self, max: usize) -> Self {
        self.max_content_length = Some(max);
        self
    }

    pub fn validate_response(&self, response: &AiResponse) -> Result<()> {
        if !response.success {
            let details = response
                .error
                .as_deref()
                .unwrap_or("no error message")
                .to_string();
            return Err(Error::validation_with_context(
                "response marked unsuccessful",
                ErrorContext::new()
                    .with_field_path("response.success")
                    .with_details(details)
                    .with_source("response_validator"),
            ));
        }
        self.check_content(&response.content, "response.content")
    }

    /// The final chunk of a stream is exempt from the non-empty rule.
    pub fn validate_chunk(&self, chunk: &StreamingChunk) -> Result<()> {
        if chunk.is_complete && chunk.content.is_empty() {
            return Ok(());
        }
        self.check_content(&chunk.content, "chunk.content")
    }

    fn check_content(&self, content: &str, field: &str) -> Result<()> {
        if !self.allow_empty_content && content.trim().is_empty() {
            return Err(Error::validation_with_context(
                "content is empty",
                ErrorContext::new()
                    .with_field_path(field)
                    .with_source("response_validator"),
            ));
        }
        if let Some(max) = self.max_content_length {
            let len = content.chars().count();
            if len > max {
                return Err(Error::validation_with_context(
                    "content too long",
                    ErrorContext::new()
                        .with_field_path(field)
                        .with_details(format!("{} characters, maximum {}", len, max))
                        .with_source("response_validator"),
                ));
            }
        }
        Ok(())
    }
}
