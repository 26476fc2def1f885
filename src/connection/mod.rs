//! 连接模块：连接状态机、带退避的重连与健康检查。
//!
//! # Connection Module
//!
//! [`ConnectionManager`] owns the session produced by a [`Connector`] and is
//! the only place that session is created, probed or released. Everything
//! else reaches it through [`ConnectionManager::ensure_connected`].
//!
//! State machine:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!      ▲                      │  ▲  │              │
//!      │                      │  └──┘ retry        │ health check failed /
//!      └──── terminal error ──┘                    │ close / mark_unhealthy
//!      └───────────────────────────────────────────┘
//! ```

pub mod manager;

pub use manager::{ConnectionManager, ConnectionSnapshot, Connector};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
