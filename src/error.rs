use crate::error_code::ErrorKind;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "service.endpoint", "response.content")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "config_validator", "response_validator")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the relay.
///
/// Every failure a backend, the connection layer or the stream layer can
/// produce collapses into one of these variants; [`Error::kind`] gives the
/// coarse classification that retry policies whitelist against.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Connection error: {message}{}", format_endpoint(.endpoint))]
    Connection {
        message: String,
        endpoint: Option<String>,
    },

    #[error("Timeout error: {message}")]
    Timeout {
        message: String,
        timeout: Option<Duration>,
    },

    #[error("Rate limit error: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Service error: {message}")]
    Service {
        message: String,
        code: Option<String>,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("stream already active: {stream_id}")]
    StreamActive { stream_id: String },
}

fn format_endpoint(endpoint: &Option<String>) -> String {
    match endpoint {
        Some(ep) => format!(" (endpoint: {})", ep),
        None => String::new(),
    }
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection {
            message: msg.into(),
            endpoint: None,
        }
    }

    pub fn connection_to(msg: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Error::Connection {
            message: msg.into(),
            endpoint: Some(endpoint.into()),
        }
    }

    pub fn timeout(msg: impl Into<String>, timeout: Option<Duration>) -> Self {
        Error::Timeout {
            message: msg.into(),
            timeout,
        }
    }

    pub fn rate_limited(msg: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Error::RateLimit {
            message: msg.into(),
            retry_after,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::validation_with_context(msg, ErrorContext::new())
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    pub fn service(msg: impl Into<String>) -> Self {
        Error::Service {
            message: msg.into(),
            code: None,
        }
    }

    pub fn service_with_code(msg: impl Into<String>, code: impl Into<String>) -> Self {
        Error::Service {
            message: msg.into(),
            code: Some(code.into()),
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Coarse classification used by retry policies and `AiResponse::error_type`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::RateLimit { .. } => ErrorKind::RateLimit,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::Service { .. } => ErrorKind::Service,
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::StreamActive { .. } => ErrorKind::Stream,
        }
    }

    /// Backend-supplied delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The bare message without the category prefix.
    pub fn message(&self) -> String {
        match self {
            Error::Connection { message, .. }
            | Error::Timeout { message, .. }
            | Error::RateLimit { message, .. }
            | Error::Validation { message, .. }
            | Error::Service { message, .. }
            | Error::Configuration { message, .. } => message.clone(),
            Error::StreamActive { .. } => self.to_string(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Validation { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::validation_with_context(
            err.to_string(),
            ErrorContext::new().with_source("serde_json"),
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::configuration_with_context(
            err.to_string(),
            ErrorContext::new().with_source("serde_yaml"),
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Error::timeout(err.to_string(), None),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => Error::connection(err.to_string()),
            _ => Error::service(err.to_string()),
        }
    }
}
