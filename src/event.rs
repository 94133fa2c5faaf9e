//! Structured events emitted by the work queue on every state transition.
//!
//! Events are the queue's voice; per-item outcomes delivered to completion
//! sinks are the submitter's. An optional hook installed at construction
//! receives every event and can feed dashboards, trace buffers, or audit
//! logs. The hook runs on whichever thread caused the transition, so it
//! must be cheap and must not block.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CancelReason, WorkId};

/// A structured event emitted by the work queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number, per queue. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Submitted {
        id: WorkId,
        priority: i32,
    },
    Started {
        id: WorkId,
        worker: String,
    },
    Completed {
        id: WorkId,
        duration_ms: u64,
    },
    Failed {
        id: WorkId,
        error: String,
    },
    Cancelled {
        id: WorkId,
        reason: CancelReason,
    },
    PoolStarted {
        workers: usize,
    },
    PoolStopped {
        drained: bool,
    },
}

/// Callback receiving every event a queue emits.
pub type EventHook = Arc<dyn Fn(Event) + Send + Sync>;

/// Stamps and dispatches events to the configured hook, if any. With no
/// hook installed, emitting is a no-op beyond a relaxed load.
pub(crate) struct EventSink {
    hook: Option<EventHook>,
    seq: AtomicU64,
}

impl EventSink {
    pub(crate) fn new(hook: Option<EventHook>) -> Self {
        Self {
            hook,
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        let Some(hook) = &self.hook else {
            return;
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        hook(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}
