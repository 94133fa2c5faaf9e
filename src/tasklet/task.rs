//! Tasklets: lightweight cooperative units multiplexed onto a host thread.
//!
//! A tasklet is an explicit state machine, not a stack: each call to
//! `step` runs one segment to its next suspension point and says how to
//! proceed through [`Step`]. The scheduler never preempts a segment;
//! blocking inside one stalls every other tasklet on that host.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::model::{BoxError, TaskletId};
use crate::tasklet::SchedShared;

/// What a tasklet segment decided. Returned from [`Tasklet::step`].
pub enum Step {
    /// Done for now; run again on the next round of this priority band.
    Yield,
    /// Suspend for at least the given duration.
    Sleep(Duration),
    /// Suspend until the signal fires. A permit banked by an earlier
    /// `notify` is consumed immediately without suspending.
    Wait(Signal),
    /// As `Wait`, but resume anyway once the timeout elapses. Timing out
    /// is a normal resumption, not a failure; the segment can check its
    /// own condition to tell the two apart.
    WaitTimeout(Signal, Duration),
    /// Finished. The scheduler deregisters the tasklet and drops it.
    Done,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Step::Yield => "yield",
            Step::Sleep(_) => "sleep",
            Step::Wait(_) => "wait",
            Step::WaitTimeout(..) => "wait_timeout",
            Step::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// A cooperatively-scheduled unit of execution. Implementations hold
/// their own resumption state; `step` runs one segment.
///
/// A returned error (or a panic inside `step`) is caught at the scheduler
/// boundary, reported to the tasklet's error sink, and finishes the
/// tasklet. Other tasklets and the host thread are unaffected.
pub trait Tasklet: Send {
    fn step(&mut self) -> std::result::Result<Step, BoxError>;
}

struct FnTasklet<F>(F);

impl<F> Tasklet for FnTasklet<F>
where
    F: FnMut() -> std::result::Result<Step, BoxError> + Send,
{
    fn step(&mut self) -> std::result::Result<Step, BoxError> {
        (self.0)()
    }
}

/// Adapt a closure into a [`Tasklet`]. The closure is the step function;
/// captured state is the resumption state.
pub fn from_fn<F>(step: F) -> impl Tasklet
where
    F: FnMut() -> std::result::Result<Step, BoxError> + Send,
{
    FnTasklet(step)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub(crate) type ErrorSink = Box<dyn FnMut(TaskletId, &BoxError) + Send>;

/// Builder for registering a tasklet. The scheduler's public API for
/// adding work.
pub struct NewTasklet {
    pub(crate) tasklet: Box<dyn Tasklet>,
    pub(crate) band: u8,
    pub(crate) on_error: Option<ErrorSink>,
}

impl NewTasklet {
    pub fn new(tasklet: impl Tasklet + 'static) -> Self {
        Self {
            tasklet: Box::new(tasklet),
            band: 0,
            on_error: None,
        }
    }

    /// Priority band. Higher bands are resumed first; must be below the
    /// scheduler's configured `priority_levels`.
    pub fn priority(mut self, band: u8) -> Self {
        self.band = band;
        self
    }

    /// Per-tasklet error sink, invoked when a segment returns an error or
    /// panics. Without one, failures are only logged.
    pub fn on_error(mut self, sink: impl FnMut(TaskletId, &BoxError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(sink));
        self
    }
}

impl std::fmt::Debug for NewTasklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewTasklet")
            .field("band", &self.band)
            .field("has_error_sink", &self.on_error.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

struct Waiter {
    sched: Weak<SchedShared>,
    id: TaskletId,
}

struct SignalState {
    permits: u32,
    waiters: Vec<Waiter>,
}

/// A semaphore-flavored wake primitive connecting external events to
/// suspended tasklets.
///
/// `notify` wakes the longest-waiting tasklet suspended on this signal;
/// with nobody waiting it banks a permit that the next `Wait` consumes
/// without suspending. Clones share the same state; any thread may
/// notify, including work-queue workers and interrupt-deferred handlers.
#[derive(Clone)]
pub struct Signal {
    state: Arc<Mutex<SignalState>>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SignalState {
                permits: 0,
                waiters: Vec::new(),
            })),
        }
    }

    /// Fire the signal. Wakes one waiter or banks one permit.
    pub fn notify(&self) {
        let waiter = {
            let mut state = self.state.lock().unwrap();
            if state.waiters.is_empty() {
                state.permits += 1;
                None
            } else {
                Some(state.waiters.remove(0))
            }
        };
        // Wake outside the signal lock; the scheduler takes its own.
        if let Some(waiter) = waiter {
            if let Some(sched) = waiter.sched.upgrade() {
                sched.wake(waiter.id);
            }
        }
    }

    /// Consume a banked permit, if any.
    pub(crate) fn try_consume(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Register a suspended tasklet for the next `notify`.
    pub(crate) fn enlist(&self, sched: Weak<SchedShared>, id: TaskletId) {
        self.state.lock().unwrap().waiters.push(Waiter { sched, id });
    }

    /// Drop a tasklet's pending registration (removal or wait timeout).
    pub(crate) fn delist(&self, id: TaskletId) {
        self.state.lock().unwrap().waiters.retain(|w| w.id != id);
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Signal")
            .field("permits", &state.permits)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
