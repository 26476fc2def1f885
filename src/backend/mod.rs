//! Concrete backends.
//!
//! A backend implements [`Backend`](crate::adapter::managed::Backend) and gets
//! connection management, timeouts and reconnection from
//! [`ManagedAdapter`](crate::adapter::managed::ManagedAdapter). The wire
//! format is a property of each backend only.

pub mod http;

pub use http::HttpBackend;
