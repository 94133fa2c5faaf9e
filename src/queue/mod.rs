//! Work queue: the public façade over the synchronized item queue and the
//! worker thread pool.
//!
//! All submissions and lifecycle transitions go through here. The queue
//! accepts work from the moment it is constructed — items submitted
//! before `start` simply wait for the first worker — and rejects
//! everything after `stop`. Construct explicitly and pass it where it is
//! needed; there is deliberately no process-wide default instance.

mod sync;
pub(crate) mod worker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::event::{EventHook, EventKind, EventSink};
use crate::item::{Work, WorkCell, WorkHandle};
use crate::model::{CancelReason, OverflowPolicy, QueueStats, WorkQueueConfig};
use self::sync::{Push, SyncQueue};
use self::worker::{PoolStats, WorkerPool};

/// Outcome of a bounded-wait submission. Timing out is normal control
/// flow: the item never entered the queue, ownership never transferred,
/// and no completion sink fires.
#[derive(Debug)]
pub enum Submitted {
    Accepted(WorkHandle),
    TimedOut,
}

struct Lifecycle {
    pool: Option<WorkerPool>,
    started: bool,
    stopped: bool,
}

/// A pool-backed work queue. See the crate docs for the full model.
pub struct WorkQueue {
    config: WorkQueueConfig,
    queue: Arc<SyncQueue>,
    events: Arc<EventSink>,
    stats: Arc<PoolStats>,
    lifecycle: Mutex<Lifecycle>,
}

impl WorkQueue {
    /// Create a queue with the given configuration. Workers are not
    /// spawned until [`start`](Self::start).
    pub fn new(config: WorkQueueConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a queue that reports every state transition to `hook`.
    pub fn with_event_hook(config: WorkQueueConfig, hook: EventHook) -> Self {
        Self::build(config, Some(hook))
    }

    fn build(config: WorkQueueConfig, hook: Option<EventHook>) -> Self {
        Self {
            queue: Arc::new(SyncQueue::new(config.capacity, config.overflow)),
            events: Arc::new(EventSink::new(hook)),
            stats: Arc::new(PoolStats::default()),
            lifecycle: Mutex::new(Lifecycle {
                pool: None,
                started: false,
                stopped: false,
            }),
            config,
        }
    }

    /// Submit work for asynchronous execution. Ownership of the callable
    /// transfers to the queue on acceptance; the returned handle supports
    /// cancellation and state snapshots.
    ///
    /// Backpressure follows the configured overflow policy: `Block` waits
    /// indefinitely for a slot, `Reject` and a failed `EvictLowest` return
    /// [`Error::QueueFull`]. After `stop` this always returns
    /// [`Error::QueueClosed`], never blocks.
    pub fn submit(&self, work: Work) -> Result<WorkHandle> {
        match self.submit_within_inner(work, None)? {
            Submitted::Accepted(handle) => Ok(handle),
            // No deadline, so a Block wait cannot time out.
            Submitted::TimedOut => Err(Error::QueueFull),
        }
    }

    /// Like [`submit`](Self::submit), but bounds a `Block` wait. Returns
    /// `Submitted::TimedOut` when no slot opened within `timeout`; the
    /// work is dropped unexecuted and its sink never fires, since the
    /// queue never took ownership.
    pub fn submit_within(&self, work: Work, timeout: Duration) -> Result<Submitted> {
        self.submit_within_inner(work, Some(timeout))
    }

    fn submit_within_inner(&self, work: Work, timeout: Option<Duration>) -> Result<Submitted> {
        let cell = WorkCell::new(work);
        let priority = cell.priority;

        match self.queue.push(Arc::clone(&cell), timeout) {
            Push::Accepted { evicted } => {
                debug!(id = %cell.id, priority, "work submitted");
                self.events.emit(EventKind::Submitted {
                    id: cell.id,
                    priority,
                });
                if let Some(victim) = evicted {
                    // Lost the race only if the submitter cancelled the
                    // victim concurrently; its notice fired either way.
                    if victim.cancel(CancelReason::Evicted).is_ok() {
                        debug!(id = %victim.id, "evicted lowest-priority item");
                        self.events.emit(EventKind::Cancelled {
                            id: victim.id,
                            reason: CancelReason::Evicted,
                        });
                    }
                }
                Ok(Submitted::Accepted(WorkHandle::new(cell)))
            }
            Push::Full => match self.config.overflow {
                OverflowPolicy::Block if timeout.is_some() => Ok(Submitted::TimedOut),
                _ => Err(Error::QueueFull),
            },
            Push::Closed => Err(Error::QueueClosed),
        }
    }

    /// Spawn the configured worker pool. Deterministic on misuse: a
    /// second `start` returns [`Error::AlreadyStarted`], `start` after
    /// `stop` returns [`Error::QueueClosed`].
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.stopped {
            return Err(Error::QueueClosed);
        }
        if lifecycle.started {
            return Err(Error::AlreadyStarted);
        }

        let pool = WorkerPool::spawn(
            Arc::clone(&self.queue),
            Arc::clone(&self.events),
            Arc::clone(&self.stats),
            &self.config,
        )?;
        lifecycle.pool = Some(pool);
        lifecycle.started = true;

        info!(
            name = %self.config.name,
            workers = self.config.workers,
            "work queue started"
        );
        self.events.emit(EventKind::PoolStarted {
            workers: self.config.workers,
        });
        Ok(())
    }

    /// Stop the queue and join the workers. Idempotent.
    ///
    /// With `drain`, returns only after every previously pending or
    /// running item reached a terminal state. Without, returns promptly:
    /// undelivered items receive `Cancelled { reason: Shutdown }` notices
    /// and workers finish only their in-flight item. A queue that was
    /// never started cannot drain; its pending items are cancelled.
    pub fn stop(&self, drain: bool) {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if lifecycle.stopped {
            return;
        }
        lifecycle.stopped = true;

        let drained = drain && lifecycle.pool.is_some();
        let leftovers = self.queue.close(drained);
        for cell in leftovers {
            if cell.cancel(CancelReason::Shutdown).is_ok() {
                self.events.emit(EventKind::Cancelled {
                    id: cell.id,
                    reason: CancelReason::Shutdown,
                });
            }
        }

        if let Some(pool) = lifecycle.pool.take() {
            pool.join();
        }

        info!(name = %self.config.name, drained, "work queue stopped");
        self.events.emit(EventKind::PoolStopped { drained });
    }

    /// Approximate number of pending items. A snapshot, not a guarantee.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Execution counters so far.
    pub fn stats(&self) -> QueueStats {
        self.stats.snapshot()
    }

    /// True when nothing is pending and nothing is executing.
    pub fn is_idle(&self) -> bool {
        self.queue.len() == 0 && self.stats.in_flight() == 0
    }

    pub fn config(&self) -> &WorkQueueConfig {
        &self.config
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop(self.config.drain_on_stop);
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.config.name)
            .field("workers", &self.config.workers)
            .field("pending", &self.pending_count())
            .finish()
    }
}
