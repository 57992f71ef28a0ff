use axum::response::sse::Event as SseEvent;
use futures::stream::{self, BoxStream, Fuse};
use futures::{Stream, StreamExt};
use quorum_core::events::Event;
use quorum_telemetry::TracePoller;
use tokio::sync::mpsc;

/// Default number of events buffered between a run and its client.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Serialize an event's wire payload: the whole event as one JSON object.
pub fn serialize_event(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        tracing::warn!(error = %e, event_type = %event.event_type.as_str(), "event serialization failed");
        "{}".into()
    })
}

/// A raw SSE frame: `event: <type>\ndata: <json>\n\n`.
pub fn frame(event: &Event) -> String {
    format!("event: {}\ndata: {}\n\n", event.event_type.as_str(), serialize_event(event))
}

pub fn sse_event(event: &Event) -> SseEvent {
    SseEvent::default()
        .event(event.event_type.as_str())
        .data(serialize_event(event))
}

type TraceStream = Fuse<BoxStream<'static, Event>>;

fn no_traces() -> TraceStream {
    stream::pending().boxed().fuse()
}

/// Drive a run to completion on its own task and forward its events, merged
/// with any trace events, into the returned receiver.
///
/// The run is driven to its end even if the receiver is dropped; delivery
/// simply stops. The trace poller is stopped once the terminal event is seen
/// so no trace event follows it.
pub fn spawn_run<S>(run: S, poller: Option<TracePoller>, buffer: usize) -> mpsc::Receiver<Event>
where
    S: Stream<Item = Event> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(forward(run, poller, tx));
    rx
}

async fn forward<S>(run: S, poller: Option<TracePoller>, tx: mpsc::Sender<Event>)
where
    S: Stream<Item = Event> + Send + 'static,
{
    let mut run = std::pin::pin!(run);
    let poller_handle = poller.as_ref().map(TracePoller::handle);
    let mut traces = match poller {
        Some(poller) => poller.into_stream().boxed().fuse(),
        None => no_traces(),
    };
    let mut connected = true;

    loop {
        let event = tokio::select! {
            biased;
            next = run.next() => match next {
                Some(event) => event,
                None => break,
            },
            Some(event) = traces.next() => event,
        };

        if event.is_terminal() {
            if let Some(handle) = &poller_handle {
                handle.stop();
            }
            traces = no_traces();
        }

        if connected && tx.send(event).await.is_err() {
            connected = false;
            tracing::info!("client disconnected, run continues without delivery");
        }
    }

    if let Some(handle) = poller_handle {
        handle.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::events::EventType;
    use quorum_core::ids::SessionId;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(kind: EventType) -> Event {
        Event::new(kind, &SessionId::from_raw("sess_1"), json!({"n": 1}))
    }

    #[test]
    fn frame_has_type_and_json_body() {
        let frame = frame(&event(EventType::AgentProgress));
        assert!(frame.starts_with("event: agent_progress\ndata: {"));
        assert!(frame.ends_with("}\n\n"));

        let data = frame.lines().nth(1).unwrap().trim_start_matches("data: ");
        let parsed: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(parsed["type"], "agent_progress");
        assert_eq!(parsed["session_id"], "sess_1");
        assert_eq!(parsed["data"]["n"], 1);
    }

    #[tokio::test]
    async fn forwards_run_events_in_order() {
        let run = stream::iter(vec![
            event(EventType::SessionStarted),
            event(EventType::AgentProgress),
            event(EventType::WorkflowCompleted),
        ]);
        let mut rx = spawn_run(run, None, 4);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(event.event_type);
        }
        assert_eq!(
            kinds,
            vec![EventType::SessionStarted, EventType::AgentProgress, EventType::WorkflowCompleted]
        );
    }

    #[tokio::test]
    async fn run_continues_after_client_disconnects() {
        let produced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&produced);
        let run = async_stream::stream! {
            for _ in 0..10 {
                counter.fetch_add(1, Ordering::SeqCst);
                yield event(EventType::AgentProgress);
                tokio::task::yield_now().await;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            yield event(EventType::WorkflowCompleted);
        };

        let rx = spawn_run(run, None, 1);
        drop(rx);

        for _ in 0..200 {
            if produced.load(Ordering::SeqCst) == 11 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(produced.load(Ordering::SeqCst), 11);
    }
}
