//! Out-of-band reconciliation of tool calls made inside hosted runtimes.
//!
//! Specialists that run in a separately hosted runtime make their own tool
//! calls where no local interceptor can see them. The poller periodically
//! asks the telemetry store for every span carrying the run's operation id
//! and turns spans it has not seen before into `trace_*` events.
//!
//! Latency is bounded by store ingestion delay plus the poll interval
//! (typically 4 to 7 seconds). Events from this channel carry no ordering
//! relation to the orchestrator's own events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use quorum_core::events::{Event, EventType};
use quorum_core::ids::{OperationId, SessionId};

use crate::trace_event::TraceEvent;
use crate::trace_store::{TraceQuery, TraceStore, TraceStoreError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    #[serde(with = "quorum_core::duration")]
    pub interval: Duration,
    /// How far back the first poll looks.
    #[serde(with = "quorum_core::duration")]
    pub lookback: Duration,
    /// Subtracted from the previous poll time to absorb ingestion jitter.
    #[serde(with = "quorum_core::duration")]
    pub overlap: Duration,
    pub row_limit: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            lookback: Duration::from_secs(30),
            overlap: Duration::from_secs(1),
            row_limit: 100,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollerState {
    NotStarted,
    Polling,
    Stopped,
}

/// Cloneable control handle for a running poller.
#[derive(Clone)]
pub struct PollerHandle {
    cancel: CancellationToken,
    state: Arc<Mutex<PollerState>>,
}

impl PollerHandle {
    /// Ask the poller to stop. Any in-flight query is dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> PollerState {
        *self.state.lock()
    }
}

fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Marks the poller stopped however its stream ends, including being dropped.
struct StopGuard(Arc<Mutex<PollerState>>);

impl Drop for StopGuard {
    fn drop(&mut self) {
        *self.0.lock() = PollerState::Stopped;
    }
}

pub struct TracePoller {
    store: Arc<dyn TraceStore>,
    config: PollerConfig,
    session_id: SessionId,
    operation_id: OperationId,
    seen: HashSet<String>,
    last_poll: Option<DateTime<Utc>>,
    polls: u64,
    handle: PollerHandle,
}

impl TracePoller {
    pub fn new(
        store: Arc<dyn TraceStore>,
        config: PollerConfig,
        session_id: SessionId,
        operation_id: OperationId,
    ) -> Self {
        Self {
            store,
            config,
            session_id,
            operation_id,
            seen: HashSet::new(),
            last_poll: None,
            polls: 0,
            handle: PollerHandle {
                cancel: CancellationToken::new(),
                state: Arc::new(Mutex::new(PollerState::NotStarted)),
            },
        }
    }

    pub fn handle(&self) -> PollerHandle {
        self.handle.clone()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn state(&self) -> PollerState {
        self.handle.state()
    }

    /// Start of the query window for a poll issued at `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.last_poll {
            None => now - to_delta(self.config.lookback),
            Some(last) => last - to_delta(self.config.overlap),
        }
    }

    /// Run one query and translate every novel, non-administrative span.
    ///
    /// A failed query leaves the window anchor untouched so the next poll
    /// covers the gap. A partial result is logged and its rows processed.
    #[instrument(skip(self), fields(operation_id = %self.operation_id, poll = self.polls + 1))]
    pub async fn poll_once(&mut self, now: DateTime<Utc>) -> Result<Vec<Event>, TraceStoreError> {
        let query = TraceQuery {
            operation_id: self.operation_id.to_string(),
            since: self.window_start(now),
            row_limit: self.config.row_limit,
        };
        self.polls += 1;

        let table = self.store.query(&query).await?;
        self.last_poll = Some(now);
        if let Some(err) = &table.partial_error {
            warn!(error = %err, rows = table.rows.len(), "partial trace query result");
        }

        let mut events = Vec::new();
        for row in &table.rows {
            let Some(span) = TraceEvent::from_row(&table, row) else {
                debug!("skipping unparseable trace row");
                continue;
            };
            if !self.seen.insert(span.span_id.clone()) {
                continue;
            }
            if span.is_administrative() {
                continue;
            }
            events.push(self.translate(&span));
        }
        Ok(events)
    }

    fn translate(&self, span: &TraceEvent) -> Event {
        let mut data = json!({
            "source": "trace",
            "span_id": span.span_id,
            "parent_id": span.parent_id,
            "operation_id": span.operation_id,
            "span_name": span.name,
            "record_kind": span.kind,
            "span_timestamp": span.timestamp,
            "duration_ms": span.duration_ms,
            "success": span.success,
        });

        let event_type = if span.is_tool_call() {
            data["tool"] = json!(span.tool_name().unwrap_or_else(|| span.name.clone()));
            data["agent"] = json!(span.agent_name());
            data["mcp_server"] = json!(span.mcp_server());
            EventType::TraceToolCall
        } else {
            if span.is_agent_invocation() {
                data["agent"] = json!(span.agent_name());
            }
            if span.is_complete() {
                EventType::TraceSpanCompleted
            } else {
                EventType::TraceSpanStarted
            }
        };

        Event::new(event_type, &self.session_id, data)
    }

    fn heartbeat(&self) -> Event {
        Event::new(
            EventType::Heartbeat,
            &self.session_id,
            json!({
                "source": "trace",
                "operation_id": self.operation_id,
                "poll": self.polls,
                "spans_seen": self.seen.len(),
            }),
        )
    }

    /// Poll until stopped, yielding translated spans, plus a heartbeat for
    /// every successful poll that produced nothing. Query failures are
    /// logged and retried on the next interval; they never end the stream.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + 'static {
        async_stream::stream! {
            let mut poller = self;
            let cancel = poller.handle.cancel.clone();
            let interval = poller.config.interval;
            *poller.handle.state.lock() = PollerState::Polling;
            let _guard = StopGuard(poller.handle.state.clone());
            info!(operation_id = %poller.operation_id, "trace poller started");

            loop {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    r = poller.poll_once(Utc::now()) => r,
                };

                match result {
                    Ok(events) if events.is_empty() => {
                        yield poller.heartbeat();
                    }
                    Ok(events) => {
                        for event in events {
                            yield event;
                        }
                    }
                    Err(e) => warn!(error = %e, "trace poll failed, retrying next interval"),
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            info!(
                operation_id = %poller.operation_id,
                polls = poller.polls,
                spans_seen = poller.seen.len(),
                "trace poller stopped"
            );
        }
    }
}
