//! 弹性模块：重试策略与指数退避。
//!
//! # Resilience Primitives Module
//!
//! Retry policies shared by the connection layer and the query layer. Each
//! layer owns its own [`RetryPolicy`] instance, so the two budgets are
//! independent: connection failures are retried inside the connection manager
//! before a query attempt ever sees them.
//!
//! ```rust
//! use ai_relay::resilience::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .with_max_retries(2)
//!     .with_base_delay(Duration::from_millis(500))
//!     .with_max_delay(Duration::from_secs(4));
//!
//! assert_eq!(policy.calculate_delay(0), Duration::from_millis(500));
//! assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
//! assert_eq!(policy.calculate_delay(5), Duration::from_secs(4));
//! ```

pub mod retry;

pub use retry::{RetryPolicy, RetrySettings};
