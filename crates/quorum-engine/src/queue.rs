//! Bounded channel carrying intercepted tool-call phases from inside the
//! agent's tool execution path to the orchestrator's output loop.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::warn;

use quorum_core::events::ToolCallPhase;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Smallest usable capacity. The producer runs inside the consumer's task
/// and sends `started` and `completed` for one call before the consumer can
/// drain, so both must fit.
pub const MIN_QUEUE_CAPACITY: usize = 2;

/// One phase of one tool invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallEvent {
    pub phase: ToolCallPhase,
    pub tool_name: String,
    /// Per-run ordinal of this call among calls to the same tool, from 1.
    pub call_number: u32,
    pub timestamp: DateTime<Utc>,
    pub arguments: Value,
    pub args_preview: Option<String>,
    pub duration_ms: Option<u64>,
    pub result_preview: Option<String>,
    /// Set on `completed` when the tool reported an error result.
    pub is_error: bool,
}

/// Create a queue holding at most `capacity` undelivered events, raised to
/// [`MIN_QUEUE_CAPACITY`] if smaller.
pub fn tool_call_queue(capacity: usize) -> (ToolCallSender, ToolCallReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(MIN_QUEUE_CAPACITY));
    (ToolCallSender { tx }, ToolCallReceiver { rx })
}

#[derive(Clone, Debug)]
pub struct ToolCallSender {
    tx: mpsc::Sender<ToolCallEvent>,
}

impl ToolCallSender {
    /// Enqueue an event, waiting while the queue is full. An event sent after
    /// the receiver is gone is dropped with a warning.
    pub async fn send(&self, event: ToolCallEvent) {
        if let Err(e) = self.tx.send(event).await {
            warn!(tool = %e.0.tool_name, "tool-call queue closed, event dropped");
        }
    }
}

#[derive(Debug)]
pub struct ToolCallReceiver {
    rx: mpsc::Receiver<ToolCallEvent>,
}

impl ToolCallReceiver {
    /// Take every event currently queued without waiting.
    pub fn drain(&mut self) -> Vec<ToolCallEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    /// Close the queue to further sends and return whatever was still queued.
    pub fn close_and_drain(mut self) -> Vec<ToolCallEvent> {
        self.rx.close();
        self.drain()
    }
}
