//! Stream handler
//!
//! Turns a pull-based content source into ordered [`ChunkSink`] calls on a
//! spawned task. One stream at a time: a second `start_stream` while the
//! first is running fails without touching it.
//!
//! Interruption is cooperative. `interrupt_stream` cancels a token that the
//! delivery loop races against every pull, so it takes effect at the next
//! suspension point and no further pulls happen afterwards.

use super::{ChunkEvent, ChunkSink, StreamState};
use crate::telemetry::{noop_observer, Observer, RelayEvent};
use crate::{Error, Result};
use futures::{Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// How a stream ended.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub stream_id: String,
    /// `Completed` or `Failed`.
    pub state: StreamState,
    /// Chunks handed to the sink, the final chunk included.
    pub chunks_delivered: u64,
    pub interrupted: bool,
    pub error: Option<Error>,
    /// Invalid chunks dropped upstream of the handler. Reported by
    /// [`StreamTask::wait`] when the task was started by the relay client.
    pub dropped_chunks: u64,
}

impl StreamOutcome {
    pub fn is_success(&self) -> bool {
        self.state == StreamState::Completed
    }
}

#[derive(Default)]
struct Slot {
    state: StreamState,
    stream_id: Option<String>,
    cancel: Option<CancellationToken>,
    last_outcome: Option<StreamOutcome>,
}

type SharedSlot = Arc<Mutex<Slot>>;

fn lock(slot: &SharedSlot) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a running stream.
#[derive(Debug)]
pub struct StreamTask {
    stream_id: String,
    handle: JoinHandle<StreamOutcome>,
    dropped: Option<Arc<AtomicU64>>,
}

impl StreamTask {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub(crate) fn with_dropped_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.dropped = Some(counter);
        self
    }

    /// Wait for the stream to end.
    pub async fn wait(self) -> StreamOutcome {
        let mut outcome = match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => StreamOutcome {
                stream_id: self.stream_id,
                state: StreamState::Failed,
                chunks_delivered: 0,
                interrupted: false,
                error: Some(Error::service(format!("stream task ended abnormally: {}", e))),
                dropped_chunks: 0,
            },
        };
        if let Some(dropped) = &self.dropped {
            outcome.dropped_chunks = dropped.load(Ordering::SeqCst);
        }
        outcome
    }
}

/// Drives at most one stream at a time.
#[derive(Clone)]
pub struct StreamHandler {
    slot: SharedSlot,
    observer: Arc<dyn Observer>,
}

impl Default for StreamHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHandler {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            observer: noop_observer(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> StreamState {
        lock(&self.slot).state
    }

    pub fn is_streaming(&self) -> bool {
        self.state().is_active()
    }

    pub fn current_stream_id(&self) -> Option<String> {
        lock(&self.slot).stream_id.clone()
    }

    /// Result of the most recent finished stream.
    pub fn last_outcome(&self) -> Option<StreamOutcome> {
        lock(&self.slot).last_outcome.clone()
    }

    /// Start delivering `source` into `sink` on a new task.
    ///
    /// Every item becomes a non-final chunk with the next `chunk_index`. When
    /// the source is exhausted an empty final chunk follows. A source error
    /// ends the stream as `Failed`; it is logged and passed to
    /// [`ChunkSink::on_error`], never returned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_stream<S, K>(&self, source: S, sink: K) -> Result<StreamTask>
    where
        S: Stream<Item = Result<String>> + Send + 'static,
        K: ChunkSink,
    {
        let token = CancellationToken::new();
        let stream_id = Uuid::new_v4().to_string();
        {
            let mut slot = lock(&self.slot);
            if slot.state != StreamState::Idle {
                return Err(Error::StreamActive {
                    stream_id: slot.stream_id.clone().unwrap_or_default(),
                });
            }
            slot.state = StreamState::Streaming;
            slot.stream_id = Some(stream_id.clone());
            slot.cancel = Some(token.clone());
        }

        self.observer.observe(&RelayEvent::StreamStarted {
            stream_id: stream_id.clone(),
        });
        debug!(stream_id = %stream_id, "Stream started");

        let run = Delivery {
            finish: Finish {
                slot: self.slot.clone(),
                stream_id: stream_id.clone(),
                done: false,
            },
            observer: self.observer.clone(),
            token,
        };
        let handle = tokio::spawn(run.drive(source, sink));
        Ok(StreamTask {
            stream_id,
            handle,
            dropped: None,
        })
    }

    /// Request cooperative interruption of the running stream.
    ///
    /// Returns `false` when nothing is streaming.
    pub fn interrupt_stream(&self) -> bool {
        let mut slot = lock(&self.slot);
        if slot.state != StreamState::Streaming {
            return false;
        }
        slot.state = StreamState::Interrupting;
        if let Some(token) = &slot.cancel {
            token.cancel();
        }
        info!(stream_id = slot.stream_id.as_deref().unwrap_or(""), "Stream interruption requested");
        true
    }
}

/// Records the outcome and frees the slot. Also runs if the task unwinds.
struct Finish {
    slot: SharedSlot,
    stream_id: String,
    done: bool,
}

impl Finish {
    fn record(&mut self, outcome: &StreamOutcome) {
        let mut slot = lock(&self.slot);
        if slot.stream_id.as_deref() == Some(self.stream_id.as_str()) {
            slot.state = StreamState::Idle;
            slot.stream_id = None;
            slot.cancel = None;
        }
        slot.last_outcome = Some(outcome.clone());
        self.done = true;
    }
}

impl Drop for Finish {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let outcome = StreamOutcome {
            stream_id: self.stream_id.clone(),
            state: StreamState::Failed,
            chunks_delivered: 0,
            interrupted: false,
            error: Some(Error::service("stream task ended abnormally")),
            dropped_chunks: 0,
        };
        self.record(&outcome);
    }
}

struct Delivery {
    finish: Finish,
    observer: Arc<dyn Observer>,
    token: CancellationToken,
}

impl Delivery {
    async fn drive<S, K>(mut self, source: S, mut sink: K) -> StreamOutcome
    where
        S: Stream<Item = Result<String>> + Send + 'static,
        K: ChunkSink,
    {
        let stream_id = self.finish.stream_id.clone();
        let mut source = Box::pin(source);
        let mut index: u64 = 0;
        let mut interrupted = false;
        let mut failure: Option<Error> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                item = source.next() => Some(item),
            };

            match next {
                None => {
                    interrupted = true;
                    break;
                }
                Some(Some(Ok(content))) => {
                    sink.on_chunk(&ChunkEvent {
                        content,
                        stream_id: stream_id.clone(),
                        chunk_index: index,
                        is_final: false,
                    });
                    index += 1;
                    tokio::task::yield_now().await;
                }
                Some(Some(Err(e))) => {
                    error!(
                        stream_id = %stream_id,
                        chunk_index = index,
                        error_type = e.kind().name(),
                        error = %e,
                        "Stream source failed"
                    );
                    sink.on_error(&e);
                    failure = Some(e);
                    break;
                }
                Some(None) => {
                    sink.on_chunk(&ChunkEvent {
                        content: String::new(),
                        stream_id: stream_id.clone(),
                        chunk_index: index,
                        is_final: true,
                    });
                    index += 1;
                    break;
                }
            }
        }

        let state = if failure.is_some() {
            StreamState::Failed
        } else {
            StreamState::Completed
        };
        let outcome = StreamOutcome {
            stream_id: stream_id.clone(),
            state,
            chunks_delivered: index,
            interrupted,
            error: failure,
            dropped_chunks: 0,
        };
        self.finish.record(&outcome);

        self.observer.observe(&RelayEvent::StreamFinished {
            stream_id: stream_id.clone(),
            state,
            chunks_delivered: index,
            interrupted,
        });
        debug!(
            stream_id = %stream_id,
            state = %state,
            chunks_delivered = index,
            interrupted,
            "Stream finished"
        );
        outcome
    }
}
