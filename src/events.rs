//! Typed publish/subscribe for engine events.
//!
//! Each event kind has its own broadcast channel. A `Subscription` wraps a
//! receiver; dropping it (or calling `dispose`) unregisters the consumer.
//! A JSON channel carries `{"type": ..., "data": ...}` frames for clients
//! outside the process.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{Instant, Interval};
use tracing::{debug, warn};

use crate::models::{LogEntry, ProcessExit};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStartEvent {
    pub execution_id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessExitEvent {
    pub execution_id: String,
    #[serde(flatten)]
    pub exit: ProcessExit,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    #[serde(rename = "log:entry")]
    LogEntry(LogEntry),
    #[serde(rename = "process:start")]
    ProcessStart(ProcessStartEvent),
    #[serde(rename = "process:exit")]
    ProcessExit(ProcessExitEvent),
}

/// A live registration on one event channel.
pub struct Subscription<T: Clone> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Next event, or `None` once the bus is gone. Lagged events are skipped.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "subscriber lagged; events dropped");
                    continue;
                }
            }
        }
    }

    /// Non-blocking poll. `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn dispose(self) {}
}

#[derive(Debug, Clone)]
pub enum FeedItem {
    Entry(LogEntry),
    Heartbeat,
}

/// Log events for one execution, interleaved with heartbeats so idle
/// consumers can detect a dead connection. Ends when dropped.
pub struct LogFeed {
    execution_id: String,
    rx: broadcast::Receiver<LogEntry>,
    heartbeat: Interval,
}

impl LogFeed {
    pub async fn next(&mut self) -> Option<FeedItem> {
        loop {
            tokio::select! {
                _ = self.heartbeat.tick() => return Some(FeedItem::Heartbeat),
                result = self.rx.recv() => match result {
                    Ok(entry) if entry.execution_id == self.execution_id => {
                        return Some(FeedItem::Entry(entry));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(execution_id = %self.execution_id, skipped = n, "log feed lagged");
                        continue;
                    }
                },
            }
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    log_tx: broadcast::Sender<LogEntry>,
    start_tx: broadcast::Sender<ProcessStartEvent>,
    exit_tx: broadcast::Sender<ProcessExitEvent>,
    client_tx: broadcast::Sender<String>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            log_tx: broadcast::channel(capacity).0,
            start_tx: broadcast::channel(capacity).0,
            exit_tx: broadcast::channel(capacity).0,
            client_tx: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_logs(&self) -> Subscription<LogEntry> {
        Subscription {
            rx: self.log_tx.subscribe(),
        }
    }

    pub fn subscribe_process_start(&self) -> Subscription<ProcessStartEvent> {
        Subscription {
            rx: self.start_tx.subscribe(),
        }
    }

    pub fn subscribe_process_exit(&self) -> Subscription<ProcessExitEvent> {
        Subscription {
            rx: self.exit_tx.subscribe(),
        }
    }

    /// Serialized frames for every event kind.
    pub fn subscribe_json(&self) -> Subscription<String> {
        Subscription {
            rx: self.client_tx.subscribe(),
        }
    }

    pub fn log_feed(&self, execution_id: &str, heartbeat: Duration) -> LogFeed {
        LogFeed {
            execution_id: execution_id.to_string(),
            rx: self.log_tx.subscribe(),
            heartbeat: tokio::time::interval_at(Instant::now() + heartbeat, heartbeat),
        }
    }

    /// Live subscriptions across all channels.
    pub fn subscriber_count(&self) -> usize {
        self.log_tx.receiver_count()
            + self.start_tx.receiver_count()
            + self.exit_tx.receiver_count()
            + self.client_tx.receiver_count()
    }

    pub fn publish_log(&self, entry: LogEntry) {
        self.publish_client(|| EngineEvent::LogEntry(entry.clone()));
        // No receivers is fine
        let _ = self.log_tx.send(entry);
    }

    pub fn publish_process_start(&self, event: ProcessStartEvent) {
        self.publish_client(|| EngineEvent::ProcessStart(event.clone()));
        let _ = self.start_tx.send(event);
    }

    pub fn publish_process_exit(&self, event: ProcessExitEvent) {
        self.publish_client(|| EngineEvent::ProcessExit(event.clone()));
        let _ = self.exit_tx.send(event);
    }

    fn publish_client(&self, event: impl FnOnce() -> EngineEvent) {
        if self.client_tx.receiver_count() == 0 {
            return;
        }
        match serde_json::to_string(&event()) {
            Ok(json) => {
                let _ = self.client_tx.send(json);
            }
            Err(e) => debug!(error = %e, "failed to serialize engine event"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
