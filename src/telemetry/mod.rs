//! 遥测模块：结构化事件、观察者接口、日志脱敏与适配器日志包装。
//!
//! Telemetry Module.
//!
//! Core components report what they do through an [`Observer`]; nothing in the
//! core depends on a concrete logging or metrics backend.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RelayEvent`] | Typed event vocabulary emitted by the core |
//! | [`Observer`] | Trait for event destinations |
//! | [`NoopObserver`] | Default observer (discards everything) |
//! | [`InMemoryObserver`] | Bounded in-memory observer for tests |
//! | [`TracingObserver`] | Forwards events as structured `tracing` events |
//! | [`CompositeObserver`] | Fans one event out to several observers |
//! | [`Sanitizer`] | Redacts secrets from maps, endpoints and free text |
//! | [`LoggedAdapter`] | Adapter wrapper with sanitized logs and per-operation metrics |

pub mod logged;
pub mod sanitize;

pub use logged::{LoggedAdapter, OperationMetrics};
pub use sanitize::Sanitizer;

use crate::connection::ConnectionState;
use crate::error_code::ErrorKind;
use crate::streaming::StreamState;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Everything the core reports.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    ConnectionAttempt {
        endpoint: String,
        attempt: u32,
        max_attempts: u32,
    },
    ConnectionEstablished {
        endpoint: String,
        attempt: u32,
        elapsed: Duration,
    },
    ConnectionFailed {
        endpoint: String,
        attempt: u32,
        error_type: ErrorKind,
        message: String,
        /// No further attempt follows.
        terminal: bool,
    },
    HealthCheck {
        endpoint: String,
        healthy: bool,
        elapsed: Duration,
    },
    Disconnected {
        endpoint: String,
        previous: ConnectionState,
    },
    QueryRetry {
        attempt: u32,
        delay: Duration,
        error_type: ErrorKind,
    },
    QueryCompleted {
        success: bool,
        retry_count: u32,
        elapsed: Duration,
        error_type: Option<ErrorKind>,
    },
    StreamStarted {
        stream_id: String,
    },
    StreamFinished {
        stream_id: String,
        state: StreamState,
        chunks_delivered: u64,
        interrupted: bool,
    },
    ChunkDropped {
        chunk_index: u64,
        reason: String,
        dropped_total: u64,
    },
    BufferFlushed {
        characters: usize,
    },
}

impl RelayEvent {
    /// Stable short name, useful as a metric key.
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::ConnectionAttempt { .. } => "connection_attempt",
            RelayEvent::ConnectionEstablished { .. } => "connection_established",
            RelayEvent::ConnectionFailed { .. } => "connection_failed",
            RelayEvent::HealthCheck { .. } => "health_check",
            RelayEvent::Disconnected { .. } => "disconnected",
            RelayEvent::QueryRetry { .. } => "query_retry",
            RelayEvent::QueryCompleted { .. } => "query_completed",
            RelayEvent::StreamStarted { .. } => "stream_started",
            RelayEvent::StreamFinished { .. } => "stream_finished",
            RelayEvent::ChunkDropped { .. } => "chunk_dropped",
            RelayEvent::BufferFlushed { .. } => "buffer_flushed",
        }
    }
}

/// Event destination. Called synchronously from the emitting task; must not block.
pub trait Observer: Send + Sync {
    fn observe(&self, event: &RelayEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn observe(&self, _event: &RelayEvent) {}
}

pub fn noop_observer() -> Arc<dyn Observer> {
    Arc::new(NoopObserver)
}

/// In-memory observer for testing. Keeps the newest `max_events`.
pub struct InMemoryObserver {
    events: Mutex<VecDeque<RelayEvent>>,
    max_events: usize,
}

impl InMemoryObserver {
    pub fn new(max: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events: max,
        }
    }

    pub fn events(&self) -> Vec<RelayEvent> {
        self.events
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.name() == name).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut e) = self.events.lock() {
            e.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryObserver {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Observer for InMemoryObserver {
    fn observe(&self, event: &RelayEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push_back(event.clone());
            while events.len() > self.max_events {
                events.pop_front();
            }
        }
    }
}

/// Emits each event as a structured `tracing` event under target `ai_relay::events`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn observe(&self, event: &RelayEvent) {
        match event {
            RelayEvent::ConnectionAttempt {
                endpoint,
                attempt,
                max_attempts,
            } => tracing::debug!(
                target: "ai_relay::events",
                endpoint = %endpoint,
                attempt,
                max_attempts,
                "connection attempt"
            ),
            RelayEvent::ConnectionEstablished {
                endpoint,
                attempt,
                elapsed,
            } => tracing::info!(
                target: "ai_relay::events",
                endpoint = %endpoint,
                attempt,
                elapsed_ms = elapsed.as_millis() as u64,
                "connection established"
            ),
            RelayEvent::ConnectionFailed {
                endpoint,
                attempt,
                error_type,
                message,
                terminal,
            } => {
                if *terminal {
                    tracing::error!(
                        target: "ai_relay::events",
                        endpoint = %endpoint,
                        attempt,
                        error_type = error_type.name(),
                        error = %message,
                        "connection failed"
                    )
                } else {
                    tracing::warn!(
                        target: "ai_relay::events",
                        endpoint = %endpoint,
                        attempt,
                        error_type = error_type.name(),
                        error = %message,
                        "connection attempt failed"
                    )
                }
            }
            RelayEvent::HealthCheck {
                endpoint,
                healthy,
                elapsed,
            } => tracing::debug!(
                target: "ai_relay::events",
                endpoint = %endpoint,
                healthy,
                elapsed_ms = elapsed.as_millis() as u64,
                "health check"
            ),
            RelayEvent::Disconnected { endpoint, previous } => tracing::info!(
                target: "ai_relay::events",
                endpoint = %endpoint,
                previous = %previous,
                "disconnected"
            ),
            RelayEvent::QueryRetry {
                attempt,
                delay,
                error_type,
            } => tracing::warn!(
                target: "ai_relay::events",
                attempt,
                delay_ms = delay.as_millis() as u64,
                error_type = error_type.name(),
                "query retry scheduled"
            ),
            RelayEvent::QueryCompleted {
                success,
                retry_count,
                elapsed,
                error_type,
            } => tracing::info!(
                target: "ai_relay::events",
                success,
                retry_count,
                elapsed_ms = elapsed.as_millis() as u64,
                error_type = error_type.map(|k| k.name()).unwrap_or(""),
                "query completed"
            ),
            RelayEvent::StreamStarted { stream_id } => tracing::debug!(
                target: "ai_relay::events",
                stream_id = %stream_id,
                "stream started"
            ),
            RelayEvent::StreamFinished {
                stream_id,
                state,
                chunks_delivered,
                interrupted,
            } => tracing::info!(
                target: "ai_relay::events",
                stream_id = %stream_id,
                state = %state,
                chunks_delivered,
                interrupted,
                "stream finished"
            ),
            RelayEvent::ChunkDropped {
                chunk_index,
                reason,
                dropped_total,
            } => tracing::warn!(
                target: "ai_relay::events",
                chunk_index,
                dropped_total,
                reason = %reason,
                "chunk dropped"
            ),
            RelayEvent::BufferFlushed { characters } => tracing::trace!(
                target: "ai_relay::events",
                characters,
                "buffer flushed"
            ),
        }
    }
}

/// Fans events out to several observers in insertion order.
#[derive(Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn Observer>>,
}

impl CompositeObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl Observer for CompositeObserver {
    fn observe(&self, event: &RelayEvent) {
        for o in &self.observers {
            o.observe(event);
        }
    }
}
