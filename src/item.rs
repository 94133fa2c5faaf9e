//! Work items: a one-shot callable plus an optional completion sink.
//!
//! `Work` is the submitter-side builder. On submission the queue wraps it
//! in a shared cell that tracks lifecycle state and guards the single
//! hand-off: the callable can be taken out exactly once, by exactly one
//! worker, and the completion sink fires exactly once no matter how the
//! item ends (ran, failed, or cancelled).

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::model::{BoxError, CancelReason, Outcome, State, WorkId};

/// The deferred callable. Errors surface through the completion sink.
pub(crate) type Job = Box<dyn FnOnce() -> std::result::Result<(), BoxError> + Send + 'static>;

type Sink = Box<dyn FnOnce(WorkId, Outcome) + Send + 'static>;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a unit of deferred work. The queue's public submission type.
pub struct Work {
    pub(crate) job: Job,
    pub(crate) priority: i32,
    pub(crate) sink: Option<Sink>,
}

impl Work {
    /// Work from a fallible callable. A returned error is delivered to the
    /// completion sink as `Outcome::Failed`.
    pub fn new(job: impl FnOnce() -> std::result::Result<(), BoxError> + Send + 'static) -> Self {
        Self {
            job: Box::new(job),
            priority: 0,
            sink: None,
        }
    }

    /// Work from an infallible callable. Fire and forget.
    pub fn from_fn(job: impl FnOnce() + Send + 'static) -> Self {
        Self::new(move || {
            job();
            Ok(())
        })
    }

    /// Priority. Higher is more urgent; items of equal priority execute in
    /// submission order.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Completion sink, invoked exactly once with the item's terminal
    /// outcome. Runs on the worker thread (or the cancelling thread), so
    /// keep it short.
    pub fn on_complete(mut self, sink: impl FnOnce(WorkId, Outcome) + Send + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work")
            .field("priority", &self.priority)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

struct CellInner {
    state: State,
    job: Option<Job>,
    sink: Option<Sink>,
}

/// Shared lifecycle record for a submitted item. The queue holds one Arc
/// (while pending), the submitter's `WorkHandle` holds another.
pub(crate) struct WorkCell {
    pub(crate) id: WorkId,
    pub(crate) priority: i32,
    inner: Mutex<CellInner>,
}

impl WorkCell {
    pub(crate) fn new(work: Work) -> Arc<Self> {
        Arc::new(Self {
            id: WorkId::next(),
            priority: work.priority,
            inner: Mutex::new(CellInner {
                state: State::Pending,
                job: Some(work.job),
                sink: work.sink,
            }),
        })
    }

    pub(crate) fn state(&self) -> State {
        self.inner.lock().unwrap().state
    }

    /// Transition `Pending -> Running` and take the callable. Returns
    /// `None` if the item was cancelled first (a tombstone the worker
    /// skips). At most one caller ever receives the job.
    pub(crate) fn claim(&self) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Pending {
            return None;
        }
        let job = inner.job.take()?;
        inner.state = State::Running;
        Some(job)
    }

    /// Transition `Running -> Completed` and fire the sink. Called by the
    /// worker after the callable returns (or panics).
    pub(crate) fn finish(&self, outcome: Outcome) {
        let sink = {
            let mut inner = self.inner.lock().unwrap();
            inner.state = State::Completed;
            inner.sink.take()
        };
        // Sink runs outside the cell lock; it may touch the handle.
        if let Some(sink) = sink {
            sink(self.id, outcome);
        }
    }

    /// Transition `Pending -> Cancelled` and fire the sink with the given
    /// reason. Fails with `AlreadyCommitted` once the item left `Pending`.
    pub(crate) fn cancel(&self, reason: CancelReason) -> Result<()> {
        let sink = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Pending {
                return Err(Error::AlreadyCommitted(self.id));
            }
            inner.state = State::Cancelled;
            inner.job = None;
            inner.sink.take()
        };
        if let Some(sink) = sink {
            sink(self.id, Outcome::Cancelled { reason });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Submitter-side handle to an accepted item. Dropping the handle does not
/// affect the item.
#[derive(Clone)]
pub struct WorkHandle {
    cell: Arc<WorkCell>,
}

impl WorkHandle {
    pub(crate) fn new(cell: Arc<WorkCell>) -> Self {
        Self { cell }
    }

    pub fn id(&self) -> WorkId {
        self.cell.id
    }

    /// Snapshot of the item's lifecycle state.
    pub fn state(&self) -> State {
        self.cell.state()
    }

    /// Cancel the item if it is still pending. Effective cancellation
    /// fires the completion sink with `Cancelled { reason: Caller }`; an
    /// item already running or finished reports `AlreadyCommitted`.
    pub fn cancel(&self) -> Result<()> {
        self.cell.cancel(CancelReason::Caller)
    }
}

impl std::fmt::Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("id", &self.cell.id)
            .field("state", &self.state())
            .finish()
    }
}
