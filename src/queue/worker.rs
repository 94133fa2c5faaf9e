//! The worker thread pool: the execution engine behind a work queue.
//!
//! Each worker runs a pull loop: block on the synchronized queue, claim
//! the popped cell, run the callable, report the outcome, repeat. A
//! closed queue ends the loop. Failures inside a callable (error return
//! or panic) are caught right here at the loop boundary and funneled to
//! the item's completion sink; they never take the worker down.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, warn};

use crate::error::Result;
use crate::event::{EventKind, EventSink};
use crate::item::WorkCell;
use crate::model::{Outcome, QueueStats, WorkQueueConfig};
use crate::queue::sync::{Pop, SyncQueue};

/// Shared execution counters, updated by workers, snapshotted by the
/// façade.
#[derive(Default)]
pub(crate) struct PoolStats {
    worked: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
}

impl PoolStats {
    pub(crate) fn snapshot(&self) -> QueueStats {
        QueueStats {
            worked: self.worked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// The set of spawned worker threads. Size is fixed at spawn; joining
/// consumes the pool.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the configured number of workers, each named `{name}-{i}`.
    /// Stack size is forwarded to `std::thread::Builder` when set.
    pub(crate) fn spawn(
        queue: Arc<SyncQueue>,
        events: Arc<EventSink>,
        stats: Arc<PoolStats>,
        config: &WorkQueueConfig,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let name = format!("{}-{}", config.name, i);
            let mut builder = thread::Builder::new().name(name.clone());
            if let Some(stack) = config.stack_size {
                builder = builder.stack_size(stack);
            }
            let queue = Arc::clone(&queue);
            let events = Arc::clone(&events);
            let stats = Arc::clone(&stats);
            handles.push(builder.spawn(move || worker_loop(&name, &queue, &events, &stats))?);
        }
        Ok(Self { handles })
    }

    /// Join every worker. Callers close the queue first; otherwise this
    /// blocks until someone does.
    pub(crate) fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                // The loop catches item panics, so this is a bug.
                error!("worker thread panicked outside item execution");
            }
        }
    }
}

fn worker_loop(name: &str, queue: &SyncQueue, events: &EventSink, stats: &PoolStats) {
    debug!(worker = name, "worker started");
    loop {
        match queue.pop(None) {
            Pop::Item(cell) => run_item(name, &cell, events, stats),
            Pop::Closed => break,
            Pop::Timeout => continue,
        }
    }
    debug!(worker = name, "worker exiting");
}

/// Claim and execute one cell. A cell whose claim fails was cancelled
/// between pop and claim; skip it without ceremony.
fn run_item(name: &str, cell: &WorkCell, events: &EventSink, stats: &PoolStats) {
    let Some(job) = cell.claim() else {
        debug!(worker = name, id = %cell.id, "skipping cancelled item");
        return;
    };

    events.emit(EventKind::Started {
        id: cell.id,
        worker: name.to_string(),
    });
    debug!(worker = name, id = %cell.id, "running item");

    stats.in_flight.fetch_add(1, Ordering::Relaxed);
    let start = Instant::now();
    let result = catch_unwind(AssertUnwindSafe(job));
    let duration_ms = start.elapsed().as_millis() as u64;
    stats.in_flight.fetch_sub(1, Ordering::Relaxed);

    let outcome = match result {
        Ok(Ok(())) => {
            stats.worked.fetch_add(1, Ordering::Relaxed);
            events.emit(EventKind::Completed {
                id: cell.id,
                duration_ms,
            });
            Outcome::Done { duration_ms }
        }
        Ok(Err(err)) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(worker = name, id = %cell.id, error = %err, "item failed");
            events.emit(EventKind::Failed {
                id: cell.id,
                error: err.to_string(),
            });
            Outcome::Failed {
                error: err.to_string(),
            }
        }
        Err(panic) => {
            let error = panic_message(&panic);
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(worker = name, id = %cell.id, error = %error, "item panicked");
            events.emit(EventKind::Failed {
                id: cell.id,
                error: error.clone(),
            });
            Outcome::Failed { error }
        }
    };

    cell.finish(outcome);
}

/// Best-effort human-readable payload from a caught panic.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: non-string payload".to_string()
    }
}
