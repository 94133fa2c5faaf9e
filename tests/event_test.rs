//! Tests for the structured event stream: ordering, coverage, and wire
//! shape.

use std::sync::{Arc, Mutex};

use offload::{Event, EventKind, Work, WorkQueue, WorkQueueConfig};

fn collecting_queue() -> (WorkQueue, Arc<Mutex<Vec<Event>>>) {
    let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let queue = WorkQueue::with_event_hook(
        WorkQueueConfig::single_worker(),
        Arc::new(move |event| sink.lock().unwrap().push(event)),
    );
    (queue, events)
}

#[test]
fn lifecycle_emits_the_full_event_sequence() {
    let (queue, events) = collecting_queue();

    queue.start().unwrap();
    queue.submit(Work::from_fn(|| {})).unwrap();
    queue.stop(true);

    let events = events.lock().unwrap();
    // Sequence numbers are dense and monotonic.
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
    }

    let kinds: Vec<&'static str> = events
        .iter()
        .map(|e| match &e.kind {
            EventKind::PoolStarted { .. } => "pool_started",
            EventKind::Submitted { .. } => "submitted",
            EventKind::Started { .. } => "started",
            EventKind::Completed { .. } => "completed",
            EventKind::Failed { .. } => "failed",
            EventKind::Cancelled { .. } => "cancelled",
            EventKind::PoolStopped { .. } => "pool_stopped",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "pool_started",
            "submitted",
            "started",
            "completed",
            "pool_stopped"
        ]
    );
}

#[test]
fn failed_items_surface_in_the_stream() {
    let (queue, events) = collecting_queue();

    queue.submit(Work::new(|| Err("wire failure".into()))).unwrap();
    queue.start().unwrap();
    queue.stop(true);

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        EventKind::Failed { error, .. } if error.contains("wire failure")
    )));
}

#[test]
fn events_serialize_with_snake_case_tags() {
    let (queue, events) = collecting_queue();
    queue.submit(Work::from_fn(|| {}).priority(7)).unwrap();
    queue.stop(false);

    let events = events.lock().unwrap();
    let submitted = serde_json::to_value(&events[0]).unwrap();
    assert_eq!(submitted["kind"]["type"], "submitted");
    assert_eq!(submitted["kind"]["priority"], 7);
    assert!(submitted["timestamp"].is_string());

    let cancelled = serde_json::to_value(&events[1]).unwrap();
    assert_eq!(cancelled["kind"]["type"], "cancelled");
    assert_eq!(cancelled["kind"]["reason"], "shutdown");
}
