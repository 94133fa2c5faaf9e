//! Cooperative tasklet scheduler.
//!
//! Runs many lightweight tasklets inside one host thread, switching only
//! at the yield points each segment declares. Selection is highest
//! priority band first, longest-waiting first within a band. An idle host
//! blocks on a condition variable (with a deadline when tasklets are
//! sleeping) rather than spinning.
//!
//! The scheduler is a peer of the work queue, not a layer: a tasklet may
//! submit work items to offload blocking operations, and a work item may
//! register tasklets. A `Signal` bridges the two domains.

mod task;

pub use self::task::{NewTasklet, Signal, Step, Tasklet, from_fn};

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{BoxError, SchedulerConfig, TaskletId, TaskletState};
use crate::queue::worker::panic_message;
use self::task::ErrorSink;

/// What one scheduling turn did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Resumed one segment of the given tasklet.
    Stepped(TaskletId),
    /// Nothing became ready within the timeout.
    Idle,
    /// The scheduler was shut down.
    Shutdown,
}

struct Entry {
    /// Absent only while the host thread is inside this tasklet's `step`.
    tasklet: Option<Box<dyn Tasklet>>,
    band: u8,
    state: TaskletState,
    on_error: Option<ErrorSink>,
    /// A wake arrived while the tasklet was not suspendable; consume it
    /// at the next suspension attempt instead of losing it.
    wake_pending: bool,
    /// Removal requested mid-segment; applied when the segment yields.
    remove_pending: bool,
    /// Timer deadline while suspended (sleep, or wait-with-timeout).
    sleep_until: Option<Instant>,
    /// Signal the tasklet is suspended on, for delisting.
    waiting_on: Option<Signal>,
}

struct SchedState {
    entries: HashMap<TaskletId, Entry>,
    /// One FIFO of ready ids per priority band.
    ready: Vec<VecDeque<TaskletId>>,
    running: Option<TaskletId>,
    next_id: u64,
    shutdown: bool,
    hosted: bool,
}

pub(crate) struct SchedShared {
    state: Mutex<SchedState>,
    cv: Condvar,
}

impl SchedShared {
    /// Move a suspended tasklet back to ready. Called from `Signal`
    /// notifications, possibly from foreign threads.
    pub(crate) fn wake(&self, id: TaskletId) {
        let mut state = self.state.lock().unwrap();
        let band = {
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            match entry.state {
                TaskletState::Suspended => {
                    entry.state = TaskletState::Ready;
                    entry.sleep_until = None;
                    entry.waiting_on = None;
                    Some(entry.band)
                }
                // Running or already ready: remember the wake.
                _ => {
                    entry.wake_pending = true;
                    None
                }
            }
        };
        if let Some(band) = band {
            state.ready[band as usize].push_back(id);
            self.cv.notify_all();
        }
    }
}

/// How a finished segment left its tasklet. `Step` with signal
/// registration already performed and durations resolved to deadlines.
enum Resolved {
    Ready,
    Sleep(Instant),
    Wait(Signal, Option<Instant>),
    Done,
    Failed(BoxError),
}

/// The cooperative scheduler. Cheap to clone; clones share state, so one
/// thread can host `run_forever` while others register, remove, and
/// shut down.
#[derive(Clone)]
pub struct TaskletScheduler {
    config: SchedulerConfig,
    shared: Arc<SchedShared>,
}

impl TaskletScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let levels = config.priority_levels.max(1) as usize;
        Self {
            config,
            shared: Arc::new(SchedShared {
                state: Mutex::new(SchedState {
                    entries: HashMap::new(),
                    ready: (0..levels).map(|_| VecDeque::new()).collect(),
                    running: None,
                    next_id: 1,
                    shutdown: false,
                    hosted: false,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Register a tasklet; it starts `Ready` and is owned by the
    /// scheduler until it finishes, fails, or is removed.
    pub fn register(&self, spec: NewTasklet) -> Result<TaskletId> {
        let levels = self.config.priority_levels.max(1);
        if spec.band >= levels {
            return Err(Error::InvalidPriority {
                band: spec.band,
                levels,
            });
        }

        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Err(Error::QueueClosed);
        }

        let id = TaskletId(state.next_id);
        state.next_id += 1;
        state.entries.insert(
            id,
            Entry {
                tasklet: Some(spec.tasklet),
                band: spec.band,
                state: TaskletState::Ready,
                on_error: spec.on_error,
                wake_pending: false,
                remove_pending: false,
                sleep_until: None,
                waiting_on: None,
            },
        );
        state.ready[spec.band as usize].push_back(id);
        self.shared.cv.notify_all();

        debug!(scheduler = %self.config.name, tasklet = %id, band = spec.band, "tasklet registered");
        Ok(id)
    }

    /// Remove a tasklet. Immediate while `Ready` or `Suspended`; while
    /// `Running` the removal is deferred to the end of the current
    /// segment. Removal fires no sink.
    pub fn remove(&self, id: TaskletId) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();

        if state.running == Some(id) {
            return match state.entries.get_mut(&id) {
                Some(entry) => {
                    entry.remove_pending = true;
                    debug!(scheduler = %self.config.name, tasklet = %id, "removal deferred to yield point");
                    Ok(())
                }
                None => Err(Error::UnknownTasklet(id)),
            };
        }

        let Some(entry) = state.entries.remove(&id) else {
            return Err(Error::UnknownTasklet(id));
        };
        match entry.state {
            TaskletState::Ready => {
                state.ready[entry.band as usize].retain(|queued| *queued != id);
            }
            TaskletState::Suspended => {
                if let Some(signal) = entry.waiting_on {
                    signal.delist(id);
                }
            }
            TaskletState::Running => {}
        }
        debug!(scheduler = %self.config.name, tasklet = %id, "tasklet removed");
        Ok(())
    }

    /// Scheduling state of a tasklet, or `None` once it is gone.
    pub fn status(&self, id: TaskletId) -> Option<TaskletState> {
        let state = self.shared.state.lock().unwrap();
        state.entries.get(&id).map(|entry| entry.state)
    }

    /// Number of registered tasklets.
    pub fn tasklet_count(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }

    /// Ask the host loop to exit. `run_once` and `run_forever` observe
    /// this on their next turn; registrations are rejected afterwards.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        self.shared.cv.notify_all();
        info!(scheduler = %self.config.name, "shutdown requested");
    }

    /// Run one scheduling turn: resume at most one tasklet segment.
    ///
    /// With no tasklet ready, blocks until one becomes ready, a sleeping
    /// tasklet's deadline passes, `timeout` elapses (`Tick::Idle`, a
    /// normal outcome), or shutdown. `timeout: None` waits indefinitely.
    ///
    /// Claims the host slot for the duration of the turn; a concurrent
    /// turn on another thread (or a live [`run_forever`](Self::run_forever)
    /// host) is refused with [`Error::AlreadyStarted`].
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<Tick> {
        self.claim_host()?;
        let tick = self.turn(timeout);
        self.shared.state.lock().unwrap().hosted = false;
        Ok(tick)
    }

    fn claim_host(&self) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if state.hosted {
            return Err(Error::AlreadyStarted);
        }
        state.hosted = true;
        Ok(())
    }

    fn turn(&self, timeout: Option<Duration>) -> Tick {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock().unwrap();

        loop {
            if state.shutdown {
                return Tick::Shutdown;
            }

            let now = Instant::now();
            promote_due(&mut state, now);

            if let Some(id) = pick_next(&mut state) {
                let Some(mut tasklet) = ({
                    let entry = state.entries.get_mut(&id);
                    entry.and_then(|e| {
                        e.state = TaskletState::Running;
                        e.tasklet.take()
                    })
                }) else {
                    // Stale id left behind by a concurrent removal.
                    continue;
                };
                state.running = Some(id);
                drop(state);

                let outcome = match catch_unwind(AssertUnwindSafe(|| tasklet.step())) {
                    Ok(result) => result,
                    Err(panic) => Err(BoxError::from(panic_message(panic.as_ref()))),
                };

                // Signal registration happens before retaking the state
                // lock; `Signal::notify` takes its locks in the opposite
                // nesting and must never meet us halfway.
                let resolved = match outcome {
                    Ok(Step::Yield) => Resolved::Ready,
                    Ok(Step::Done) => Resolved::Done,
                    Ok(Step::Sleep(d)) => Resolved::Sleep(Instant::now() + d),
                    Ok(Step::Wait(signal)) => {
                        if signal.try_consume() {
                            Resolved::Ready
                        } else {
                            signal.enlist(Arc::downgrade(&self.shared), id);
                            Resolved::Wait(signal, None)
                        }
                    }
                    Ok(Step::WaitTimeout(signal, d)) => {
                        if signal.try_consume() {
                            Resolved::Ready
                        } else {
                            signal.enlist(Arc::downgrade(&self.shared), id);
                            Resolved::Wait(signal, Some(Instant::now() + d))
                        }
                    }
                    Err(err) => Resolved::Failed(err),
                };

                self.finish_segment(id, tasklet, resolved);
                return Tick::Stepped(id);
            }

            if let Some(d) = deadline {
                if now >= d {
                    return Tick::Idle;
                }
            }

            let wake_at = match (next_timer(&state), deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, b) => b,
            };
            state = match wake_at {
                None => self.shared.cv.wait(state).unwrap(),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        continue;
                    }
                    self.shared.cv.wait_timeout(state, at - now).unwrap().0
                }
            };
        }
    }

    /// Host loop: run turns until [`shutdown`](Self::shutdown). Only one
    /// thread may host a scheduler at a time; a second concurrent call
    /// returns [`Error::AlreadyStarted`]. For limited parallelism, run
    /// several independent scheduler instances, one per host thread.
    pub fn run_forever(&self) -> Result<()> {
        self.claim_host()?;
        info!(scheduler = %self.config.name, "tasklet scheduler running");

        while self.turn(None) != Tick::Shutdown {}

        self.shared.state.lock().unwrap().hosted = false;
        info!(scheduler = %self.config.name, "tasklet scheduler stopped");
        Ok(())
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Park the tasklet according to how its segment ended, or drop it
    /// (finished, failed, or removal deferred from mid-segment). Error
    /// sinks run after the state lock is released.
    fn finish_segment(&self, id: TaskletId, tasklet: Box<dyn Tasklet>, resolved: Resolved) {
        let mut report: Option<(ErrorSink, BoxError)> = None;

        {
            let mut state = self.shared.state.lock().unwrap();
            state.running = None;

            let mut drop_entry = false;
            let mut requeue_band: Option<u8> = None;

            if let Some(entry) = state.entries.get_mut(&id) {
                let removing = entry.remove_pending;
                match resolved {
                    Resolved::Failed(err) => {
                        warn!(scheduler = %self.config.name, tasklet = %id, error = %err, "tasklet segment failed");
                        if let Some(sink) = entry.on_error.take() {
                            report = Some((sink, err));
                        }
                        drop_entry = true;
                    }
                    Resolved::Done => {
                        debug!(scheduler = %self.config.name, tasklet = %id, "tasklet finished");
                        drop_entry = true;
                    }
                    resolved if removing => {
                        if let Resolved::Wait(signal, _) = resolved {
                            signal.delist(id);
                        }
                        debug!(scheduler = %self.config.name, tasklet = %id, "tasklet removed at yield point");
                        drop_entry = true;
                    }
                    Resolved::Ready => {
                        entry.tasklet = Some(tasklet);
                        entry.state = TaskletState::Ready;
                        entry.wake_pending = false;
                        requeue_band = Some(entry.band);
                    }
                    Resolved::Sleep(at) => {
                        entry.tasklet = Some(tasklet);
                        if entry.wake_pending {
                            entry.wake_pending = false;
                            entry.state = TaskletState::Ready;
                            requeue_band = Some(entry.band);
                        } else {
                            entry.state = TaskletState::Suspended;
                            entry.sleep_until = Some(at);
                        }
                    }
                    Resolved::Wait(signal, timeout_at) => {
                        entry.tasklet = Some(tasklet);
                        if entry.wake_pending {
                            // The signal fired between enlist and here.
                            entry.wake_pending = false;
                            signal.delist(id);
                            entry.state = TaskletState::Ready;
                            requeue_band = Some(entry.band);
                        } else {
                            entry.state = TaskletState::Suspended;
                            entry.sleep_until = timeout_at;
                            entry.waiting_on = Some(signal);
                        }
                    }
                }
            }

            if drop_entry {
                state.entries.remove(&id);
            }
            if let Some(band) = requeue_band {
                state.ready[band as usize].push_back(id);
            }
        }

        if let Some((mut sink, err)) = report {
            sink(id, &err);
        }
    }
}

/// Move every suspended tasklet whose timer expired back to ready.
/// Delisting clears a wait-with-timeout's pending signal registration.
fn promote_due(state: &mut SchedState, now: Instant) {
    let mut due = Vec::new();
    for (id, entry) in state.entries.iter_mut() {
        if entry.state != TaskletState::Suspended {
            continue;
        }
        let Some(at) = entry.sleep_until else {
            continue;
        };
        if at <= now {
            entry.state = TaskletState::Ready;
            entry.sleep_until = None;
            due.push((*id, entry.band, entry.waiting_on.take()));
        }
    }
    for (id, band, signal) in due {
        if let Some(signal) = signal {
            signal.delist(id);
        }
        state.ready[band as usize].push_back(id);
    }
}

/// Next ready tasklet: highest band, longest waiting within the band.
fn pick_next(state: &mut SchedState) -> Option<TaskletId> {
    for band in (0..state.ready.len()).rev() {
        if let Some(id) = state.ready[band].pop_front() {
            return Some(id);
        }
    }
    None
}

/// Earliest timer deadline among suspended tasklets.
fn next_timer(state: &SchedState) -> Option<Instant> {
    state
        .entries
        .values()
        .filter(|entry| entry.state == TaskletState::Suspended)
        .filter_map(|entry| entry.sleep_until)
        .min()
}
