//! Response buffer
//!
//! Coalesces a high-frequency chunk stream into fewer display updates. A
//! flush hands over the whole accumulated text and happens when the pending
//! text reaches `buffer_size` characters, when `flush_interval` has passed
//! since the last flush, or on request.
//!
//! The core (`push` / `take`) returns flushed text to the caller;
//! `add_chunk` / `flush` route the same text through a display callback.

use crate::telemetry::{noop_observer, Observer, RelayEvent};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Chunks above this many bytes are split before accumulation.
pub const LARGE_CHUNK_BYTES: usize = 1024 * 1024;
/// Pending text above this many bytes is flushed before more is added.
pub const MAX_PENDING_BYTES: usize = 10 * 1024 * 1024;
/// Lower bound on the piece size used when splitting a large chunk.
const MIN_SPLIT_PIECE: usize = 4096;
/// How far back from the cut `find_word_boundary` looks for whitespace.
const BOUNDARY_LOOKBACK: usize = 20;

type DisplayCallback = Box<dyn FnMut(&str) + Send>;

/// Counters reported by [`ResponseBuffer::statistics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferStatistics {
    pub chunks_processed: u64,
    pub flushes_performed: u64,
    pub total_characters: u64,
    pub current_buffer_size: usize,
    pub average_chunk_size: f64,
    pub average_flush_size: f64,
}

pub struct ResponseBuffer {
    buffer_size: usize,
    flush_interval: Duration,
    pending: String,
    pending_chars: usize,
    last_flush: Instant,
    chunks_processed: u64,
    flushes_performed: u64,
    total_characters: u64,
    display: Option<DisplayCallback>,
    observer: Arc<dyn Observer>,
}

impl std::fmt::Debug for ResponseBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBuffer")
            .field("buffer_size", &self.buffer_size)
            .field("flush_interval", &self.flush_interval)
            .field("pending_chars", &self.pending_chars)
            .field("chunks_processed", &self.chunks_processed)
            .field("flushes_performed", &self.flushes_performed)
            .finish()
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(100))
    }
}

impl ResponseBuffer {
    /// `buffer_size` is in characters; 0 flushes on every chunk.
    pub fn new(buffer_size: usize, flush_interval: Duration) -> Self {
        Self {
            buffer_size,
            flush_interval,
            pending: String::new(),
            pending_chars: 0,
            last_flush: Instant::now(),
            chunks_processed: 0,
            flushes_performed: 0,
            total_characters: 0,
            display: None,
            observer: noop_observer(),
        }
    }

    pub fn from_settings(settings: &crate::config::BufferSettings) -> Self {
        Self::new(settings.buffer_size, settings.flush_interval())
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    pub fn set_display_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.display = Some(Box::new(callback));
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending text exists and the flush interval has elapsed.
    pub fn is_due(&self) -> bool {
        !self.pending.is_empty() && self.last_flush.elapsed() >= self.flush_interval
    }

    /// Accumulate `chunk`; returns the text of every flush it triggered, in order.
    ///
    /// Empty chunks are ignored.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut flushed = Vec::new();
        if chunk.is_empty() {
            return flushed;
        }
        if self.pending.len() > MAX_PENDING_BYTES {
            warn!(pending_bytes = self.pending.len(), "Buffer getting large, forcing flush");
            flushed.extend(self.take());
        }
        if chunk.len() > LARGE_CHUNK_BYTES {
            warn!(chunk_bytes = chunk.len(), "Large chunk detected, splitting");
            let piece = (self.buffer_size / 2).clamp(MIN_SPLIT_PIECE, LARGE_CHUNK_BYTES);
            for part in split_at_word_boundaries(chunk, piece) {
                self.accumulate(part, &mut flushed);
            }
        } else {
            self.accumulate(chunk, &mut flushed);
        }
        flushed
    }

    fn accumulate(&mut self, part: &str, flushed: &mut Vec<String>) {
        let chars = part.chars().count();
        self.pending.push_str(part);
        self.pending_chars += chars;
        self.chunks_processed += 1;
        self.total_characters += chars as u64;

        if self.pending_chars >= self.buffer_size || self.is_due() {
            flushed.extend(self.take());
        }
    }

    /// Remove and return the pending text, counting a flush. `None` when empty.
    pub fn take(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.pending);
        let characters = self.pending_chars;
        self.pending_chars = 0;
        self.flushes_performed += 1;
        self.last_flush = Instant::now();
        self.observer
            .observe(&RelayEvent::BufferFlushed { characters });
        debug!(characters, flushes = self.flushes_performed, "Buffer flushed");
        Some(text)
    }

    /// [`push`](Self::push), delivering each flush to the display callback.
    pub fn add_chunk(&mut self, chunk: &str) {
        for text in self.push(chunk) {
            self.display(&text);
        }
    }

    /// Deliver pending text now. No-op when empty.
    pub fn flush(&mut self) {
        if let Some(text) = self.take() {
            self.display(&text);
        }
    }

    fn display(&mut self, text: &str) {
        if let Some(cb) = self.display.as_mut() {
            cb(text);
        }
    }

    pub fn statistics(&self) -> BufferStatistics {
        let avg = |n: u64| {
            if n == 0 {
                0.0
            } else {
                self.total_characters as f64 / n as f64
            }
        };
        BufferStatistics {
            chunks_processed: self.chunks_processed,
            flushes_performed: self.flushes_performed,
            total_characters: self.total_characters,
            current_buffer_size: self.pending_chars,
            average_chunk_size: avg(self.chunks_processed),
            average_flush_size: avg(self.flushes_performed),
        }
    }
}

/// Byte index at which to cut `text` so the first part is at most `max_len`
/// bytes, preferring whitespace within the last few bytes before the limit.
///
/// Always lands on a char boundary and is non-zero for non-empty text.
pub fn find_word_boundary(text: &str, max_len: usize) -> usize {
    if text.len() <= max_len {
        return text.len();
    }
    let mut limit = max_len;
    while limit > 0 && !text.is_char_boundary(limit) {
        limit -= 1;
    }
    let floor = limit.saturating_sub(BOUNDARY_LOOKBACK);
    // Candidates are cut positions in (floor, limit]; the char at `limit`
    // itself is the first one of the next piece.
    let at_limit = text[limit..].chars().next().map(|c| (limit, c));
    let boundary = text[..limit]
        .char_indices()
        .chain(at_limit)
        .rev()
        .take_while(|(i, _)| *i > floor)
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, _)| i);

    match boundary {
        Some(i) if i > 0 => i,
        _ if limit > 0 => limit,
        // A single char wider than max_len.
        _ => text.chars().next().map(char::len_utf8).unwrap_or(0),
    }
}

fn split_at_word_boundaries(text: &str, piece: usize) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let cut = find_word_boundary(rest, piece);
        let (head, tail) = rest.split_at(cut);
        parts.push(head);
        rest = tail;
    }
    parts
}

/// Background time-based flushing of a shared buffer.
pub struct AutoFlushHandle {
    buffer: Arc<Mutex<ResponseBuffer>>,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Tick every `interval` and flush `buffer` when its flush interval has elapsed.
///
/// Must be called from within a tokio runtime.
pub fn spawn_auto_flush(buffer: Arc<Mutex<ResponseBuffer>>, interval: Duration) -> AutoFlushHandle {
    let token = CancellationToken::new();
    let period = interval.max(Duration::from_millis(1));
    let task_buffer = buffer.clone();
    let task_token = token.clone();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    let mut buf = task_buffer.lock().unwrap_or_else(PoisonError::into_inner);
                    if buf.is_due() {
                        buf.flush();
                    }
                }
            }
        }
    });

    AutoFlushHandle {
        buffer,
        token,
        handle: Some(handle),
    }
}

impl AutoFlushHandle {
    /// Stop ticking and flush whatever is still pending.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
    }
}

impl Drop for AutoFlushHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEVER: Duration = Duration::from_secs(3600);

    fn recording(buffer_size: usize) -> (ResponseBuffer, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut buf = ResponseBuffer::new(buffer_size, NEVER);
        let s = seen.clone();
        buf.set_display_callback(move |t| s.lock().unwrap().push(t.to_string()));
        (buf, seen)
    }

    #[tokio::test]
    async fn test_zero_size_flushes_every_chunk() {
        let (mut buf, seen) = recording(0);
        for c in ["a", "bc", "d"] {
            buf.add_chunk(c);
        }
        assert_eq!(*seen.lock().unwrap(), vec!["a", "bc", "d"]);
        assert_eq!(buf.statistics().flushes_performed, 3);
    }

    #[tokio::test]
    async fn test_flushes_whole_accumulation_at_threshold() {
        let (mut buf, seen) = recording(5);
        buf.add_chunk("ab");
        buf.add_chunk("cd");
        assert!(seen.lock().unwrap().is_empty());
        buf.add_chunk("ef");
        assert_eq!(*seen.lock().unwrap(), vec!["abcdef"]);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_counts_chars_not_bytes() {
        let (mut buf, seen) = recording(3);
        buf.add_chunk("éé");
        assert!(seen.lock().unwrap().is_empty());
        buf.add_chunk("é");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_flush_and_noop_when_empty() {
        let (mut buf, seen) = recording(100);
        buf.flush();
        assert_eq!(buf.statistics().flushes_performed, 0);
        buf.add_chunk("partial");
        buf.flush();
        buf.flush();
        assert_eq!(*seen.lock().unwrap(), vec!["partial"]);
        assert_eq!(buf.statistics().flushes_performed, 1);
    }

    #[tokio::test]
    async fn test_statistics_update_without_flush() {
        let (mut buf, _) = recording(100);
        buf.add_chunk("abcd");
        buf.add_chunk("ef");
        let s = buf.statistics();
        assert_eq!(s.chunks_processed, 2);
        assert_eq!(s.total_characters, 6);
        assert_eq!(s.current_buffer_size, 6);
        assert_eq!(s.flushes_performed, 0);
        assert_eq!(s.average_chunk_size, 3.0);
        assert_eq!(s.average_flush_size, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_interval_triggers_flush() {
        let mut buf = ResponseBuffer::new(1000, Duration::from_millis(100));
        assert!(buf.push("a").is_empty());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(buf.is_due());
        assert_eq!(buf.push("b"), vec!["ab".to_string()]);
    }

    #[tokio::test]
    async fn test_large_chunk_is_split() {
        let word = "lorem ipsum ";
        let big = word.repeat(LARGE_CHUNK_BYTES / word.len() + 10);
        let mut buf = ResponseBuffer::new(usize::MAX, NEVER);
        let flushed = buf.push(&big);
        assert!(flushed.is_empty());
        assert!(buf.statistics().chunks_processed > 1);
        assert_eq!(buf.take().unwrap(), big);
    }

    #[test]
    fn test_find_word_boundary() {
        assert_eq!(find_word_boundary("short", 10), 5);
        assert_eq!(find_word_boundary("hello world again", 12), 11);
        assert_eq!(find_word_boundary("abcdefghijklmnopqrstuvwxyz0123456789", 30), 30);
        // 'é' spans bytes 1..3; a cut at 2 backs off to 1.
        assert_eq!(find_word_boundary("aéb", 2), 1);
        assert_eq!(find_word_boundary("éa", 1), 2);
    }

    #[test]
    fn test_split_reassembles() {
        let text = "one two three four five six seven";
        let parts = split_at_word_boundaries(text, 8);
        assert!(parts.iter().all(|p| p.len() <= 8));
        assert_eq!(parts.concat(), text);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_flush_ticker() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let mut buf = ResponseBuffer::new(1000, Duration::from_millis(100));
        let s = seen.clone();
        buf.set_display_callback(move |t| s.lock().unwrap().push(t.to_string()));
        let shared = Arc::new(Mutex::new(buf));

        let handle = spawn_auto_flush(shared.clone(), Duration::from_millis(50));
        shared.lock().unwrap().add_chunk("tick");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["tick"]);

        shared.lock().unwrap().add_chunk("tail");
        handle.stop().await;
        assert_eq!(*seen.lock().unwrap(), vec!["tick", "tail"]);
    }
}
