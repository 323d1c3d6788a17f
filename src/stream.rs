//! Byte-to-line framing for child process output.
//!
//! Each execution owns one buffer per stream kind. Complete lines are
//! persisted as a batch and then published in arrival order. Calls for the
//! same execution are serialized by a per-execution async mutex.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db::DbHandle;
use crate::events::EventBus;
use crate::models::{LogEntry, LogStream, now_timestamp};

pub const TRUNCATION_MARKER: &str = "... [truncated]";

const FLUSH_ORDER: [LogStream; 3] = [LogStream::Stdout, LogStream::Stderr, LogStream::System];

#[derive(Default)]
struct ExecutionBuffers {
    streams: HashMap<LogStream, Vec<u8>>,
}

pub struct StreamHandler {
    db: DbHandle,
    events: EventBus,
    max_buffer_bytes: usize,
    max_line_chars: usize,
    buffers: std::sync::Mutex<HashMap<String, Arc<Mutex<ExecutionBuffers>>>>,
}

impl StreamHandler {
    pub fn new(db: DbHandle, events: EventBus, max_buffer_bytes: usize, max_line_chars: usize) -> Self {
        Self {
            db,
            events,
            max_buffer_bytes: max_buffer_bytes.max(1),
            max_line_chars,
            buffers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn buffer_for(&self, execution_id: &str) -> Arc<Mutex<ExecutionBuffers>> {
        let mut map = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(execution_id.to_string()).or_default().clone()
    }

    fn take_buffer(&self, execution_id: &str) -> Option<Arc<Mutex<ExecutionBuffers>>> {
        let mut map = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(execution_id)
    }

    fn existing_buffer(&self, execution_id: &str) -> Option<Arc<Mutex<ExecutionBuffers>>> {
        let map = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        map.get(execution_id).cloned()
    }

    /// Append a raw chunk and emit every line it completes. Returns the number
    /// of entries emitted.
    pub async fn handle_output(&self, execution_id: &str, stream: LogStream, bytes: &[u8]) -> usize {
        let buffer = self.buffer_for(execution_id);
        let mut guard = buffer.lock().await;
        let pending = guard.streams.entry(stream).or_default();
        pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        if let Some(last_newline) = pending.iter().rposition(|b| *b == b'\n') {
            let rest = pending.split_off(last_newline + 1);
            let complete = std::mem::replace(pending, rest);
            // Drop the final terminator so split yields only complete lines
            for raw in complete[..complete.len() - 1].split(|b| *b == b'\n') {
                lines.push(decode_line(raw));
            }
        }

        if pending.len() > self.max_buffer_bytes {
            let excess = pending.len() - self.max_buffer_bytes;
            pending.drain(..excess);
            warn!(
                execution_id,
                stream = stream.as_str(),
                dropped_bytes = excess,
                "output buffer exceeded limit; oldest bytes dropped"
            );
        }

        let entries: Vec<LogEntry> = lines
            .into_iter()
            .map(|content| self.entry(execution_id, stream, content))
            .collect();
        self.emit(entries).await
    }

    /// Persist whatever is still buffered for the execution as final entries
    /// and release the buffer. Later calls are no-ops.
    pub async fn flush_buffer(&self, execution_id: &str) -> usize {
        let Some(buffer) = self.take_buffer(execution_id) else {
            return 0;
        };
        let mut guard = buffer.lock().await;
        let mut entries = Vec::new();
        for stream in FLUSH_ORDER {
            if let Some(rest) = guard.streams.remove(&stream)
                && !rest.is_empty()
            {
                entries.push(self.entry(execution_id, stream, decode_line(&rest)));
            }
        }
        self.emit(entries).await
    }

    /// Release the buffer without persisting anything. Returns whether a
    /// buffer existed.
    pub fn clear_buffer(&self, execution_id: &str) -> bool {
        let cleared = self.take_buffer(execution_id).is_some();
        if cleared {
            debug!(execution_id, "output buffer cleared");
        }
        cleared
    }

    /// Persist and publish a lifecycle note.
    pub async fn append_system(&self, execution_id: &str, message: &str) {
        let buffer = self.existing_buffer(execution_id);
        let _guard = match &buffer {
            Some(buffer) => Some(buffer.lock().await),
            None => None,
        };
        let entry = self.entry(execution_id, LogStream::System, message.to_string());
        self.emit(vec![entry]).await;
    }

    /// Bytes currently held for the execution across all streams.
    pub async fn buffered_bytes(&self, execution_id: &str) -> usize {
        match self.existing_buffer(execution_id) {
            Some(buffer) => buffer.lock().await.streams.values().map(Vec::len).sum(),
            None => 0,
        }
    }

    fn entry(&self, execution_id: &str, stream: LogStream, content: String) -> LogEntry {
        LogEntry {
            execution_id: execution_id.to_string(),
            stream,
            content: truncate_line(content, self.max_line_chars),
            timestamp: now_timestamp(),
        }
    }

    async fn emit(&self, entries: Vec<LogEntry>) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let batch = entries.clone();
        if let Err(e) = self.db.call(move |db| db.insert_log_entries(&batch)).await {
            warn!(
                execution_id = %entries[0].execution_id,
                error = %format!("{:#}", e),
                "failed to persist log entries"
            );
        }
        let count = entries.len();
        for entry in entries {
            self.events.publish_log(entry);
        }
        count
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Cut `content` so that it plus the marker fits in `max_chars`. A bound
/// shorter than the marker gets as much of the marker as fits.
pub fn truncate_line(content: String, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content;
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars <= marker_len {
        return TRUNCATION_MARKER.chars().take(max_chars).collect();
    }
    let mut truncated: String = content.chars().take(max_chars - marker_len).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
