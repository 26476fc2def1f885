//! 错误分类：把具体错误归入少量可被重试策略引用的类别。
//!
//! Error kinds.
//!
//! Every [`crate::Error`] maps to exactly one [`ErrorKind`]. Retry policies
//! whitelist kinds rather than concrete errors, and the kind's
//! [`name`](ErrorKind::name) is what ends up in `AiResponse::error_type`.
//!
//! | Kind          | Name                  | Retryable by default |
//! |---------------|-----------------------|----------------------|
//! | Connection    | `connection_error`    | yes                  |
//! | Timeout       | `timeout_error`       | yes                  |
//! | RateLimit     | `rate_limit_error`    | yes                  |
//! | Validation    | `validation_error`    | no                   |
//! | Service       | `service_error`       | no                   |
//! | Configuration | `configuration_error` | no                   |
//! | Stream        | `stream_error`        | no                   |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay::error_code::ErrorKind;
//!
//! let kind = ErrorKind::from_http_status(429);
//! assert_eq!(kind.name(), "rate_limit_error");
//! assert!(kind.retryable());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure establishing or using a connection
    Connection,
    /// Operation exceeded its time window
    Timeout,
    /// Backend signaled throttling
    RateLimit,
    /// Response or chunk failed shape checks
    Validation,
    /// Catch-all backend failure
    Service,
    /// Invalid configuration
    Configuration,
    /// Stream lifecycle misuse (e.g. a second concurrent stream)
    Stream,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::Connection,
        ErrorKind::Timeout,
        ErrorKind::RateLimit,
        ErrorKind::Validation,
        ErrorKind::Service,
        ErrorKind::Configuration,
        ErrorKind::Stream,
    ];

    /// Returns the stable name (e.g., `"timeout_error"`).
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection => "connection_error",
            Self::Timeout => "timeout_error",
            Self::RateLimit => "rate_limit_error",
            Self::Validation => "validation_error",
            Self::Service => "service_error",
            Self::Configuration => "configuration_error",
            Self::Stream => "stream_error",
        }
    }

    /// Returns whether this kind is retryable by default.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::RateLimit)
    }

    /// Inverse of [`ErrorKind::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Maps an HTTP status code to the most likely kind.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            408 | 504 => Self::Timeout,
            429 => Self::RateLimit,
            502 | 503 => Self::Connection,
            400 | 422 => Self::Validation,
            _ => Self::Service,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
