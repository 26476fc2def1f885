//! 流式模块：单流驱动、协作式中断与显示缓冲。
//!
//! # Streaming Module
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`StreamHandler`] | Drives at most one stream at a time into a [`ChunkSink`] |
//! | [`ResponseBuffer`] | Coalesces many small chunks into fewer display flushes |
//! | [`contents`] | Turns an adapter [`ChunkStream`] into a content source for the handler |
//!
//! ```rust
//! use ai_relay::streaming::{ChunkEvent, StreamHandler};
//! use futures::stream;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ai_relay::Result<()> {
//! let handler = StreamHandler::new();
//! let mut seen = Vec::new();
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!
//! let source = stream::iter(vec![
//!     Ok::<_, ai_relay::Error>("Hel".to_string()),
//!     Ok("lo".to_string()),
//! ]);
//! let task = handler.start_stream(source, move |c: &ChunkEvent| {
//!     let _ = tx.send((c.content.clone(), c.is_final));
//! })?;
//! task.wait().await;
//!
//! while let Ok(item) = rx.try_recv() {
//!     seen.push(item);
//! }
//! assert_eq!(seen.last(), Some(&(String::new(), true)));
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod handler;

pub use buffer::{
    find_word_boundary, spawn_auto_flush, AutoFlushHandle, BufferStatistics, ResponseBuffer,
};
pub use handler::{StreamHandler, StreamOutcome, StreamTask};

use crate::adapter::ChunkStream;
use crate::{Error, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the handler's single stream slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
    Interrupting,
    Completed,
    Failed,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Streaming => "streaming",
            StreamState::Interrupting => "interrupting",
            StreamState::Completed => "completed",
            StreamState::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, StreamState::Streaming | StreamState::Interrupting)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a sink receives for every delivered chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEvent {
    pub content: String,
    pub stream_id: String,
    pub chunk_index: u64,
    pub is_final: bool,
}

/// Receiver of stream output. Runs inside the streaming task; must not block.
pub trait ChunkSink: Send + 'static {
    fn on_chunk(&mut self, chunk: &ChunkEvent);

    /// The source failed after `on_chunk` saw everything delivered so far.
    fn on_error(&mut self, _error: &Error) {}
}

impl<F> ChunkSink for F
where
    F: FnMut(&ChunkEvent) + Send + 'static,
{
    fn on_chunk(&mut self, chunk: &ChunkEvent) {
        self(chunk)
    }
}

/// Content-only view of an adapter stream.
///
/// The adapter's own terminal chunk is skipped when it carries no content:
/// the handler appends its own final chunk.
pub fn contents(stream: ChunkStream) -> BoxStream<'static, Result<String>> {
    stream
        .filter_map(|item| async move {
            match item {
                Ok(chunk) if chunk.is_complete && chunk.content.is_empty() => None,
                Ok(chunk) => Some(Ok(chunk.content)),
                Err(e) => Some(Err(e)),
            }
        })
        .boxed()
}
