//! Core data model.
//!
//! A work item is a one-shot callable handed to the queue for deferred
//! execution. It has identity (a monotonic sequence number), a priority,
//! and lifecycle state. A tasklet is a cooperatively-scheduled step
//! machine multiplexed onto a host thread; it has its own id space per
//! scheduler and its own state set.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Boxed error carried out of a failing work item or tasklet segment.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for work item ids. Process-wide monotonic; doubles as the FIFO
/// tie-breaker among items of equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkId(pub u64);

static NEXT_WORK_ID: AtomicU64 = AtomicU64::new(1);

impl WorkId {
    /// Allocate the next id. Never reused within a process.
    pub(crate) fn next() -> Self {
        Self(NEXT_WORK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Newtype for tasklet ids. Unique per scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskletId(pub u64);

impl std::fmt::Display for TaskletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Work item state
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Submitted, waiting in the queue for a worker.
    Pending,
    /// A worker claimed the item and is executing it.
    Running,
    /// Execution finished (successfully or not). Terminal.
    Completed,
    /// Removed before execution started. Terminal.
    Cancelled,
}

impl State {
    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Cancelled)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Running => "running",
            State::Completed => "completed",
            State::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Why a pending item was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The submitter called `WorkHandle::cancel`.
    Caller,
    /// `stop(drain=false)` discarded the item before a worker reached it.
    Shutdown,
    /// The overflow policy evicted the item to make room for a
    /// higher-priority submission.
    Evicted,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CancelReason::Caller => "caller",
            CancelReason::Shutdown => "shutdown",
            CancelReason::Evicted => "evicted",
        };
        write!(f, "{s}")
    }
}

/// Terminal result of a work item, delivered exactly once to its
/// completion sink. "My work failed" arrives here; "the queue rejected my
/// request" arrives through the `submit` return value. Never conflated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The callable returned normally.
    Done { duration_ms: u64 },
    /// The callable returned an error or panicked. The worker survives.
    Failed { error: String },
    /// The item never ran.
    Cancelled { reason: CancelReason },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Done { .. })
    }
}

// ---------------------------------------------------------------------------
// Tasklet state
// ---------------------------------------------------------------------------

/// Scheduling state of a tasklet. At most one tasklet is `Running` per
/// scheduler host thread at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskletState {
    /// Eligible for its next segment.
    Ready,
    /// Currently executing a segment on the host thread.
    Running,
    /// Waiting on a timer or a `Signal`.
    Suspended,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do when a bounded queue is full at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Block the submitter until a worker frees a slot (or the queue
    /// closes). `submit_within` bounds the wait.
    Block,
    /// Reject immediately with `QueueFull`.
    Reject,
    /// Evict the lowest-priority, youngest pending item (its sink fires
    /// with `Cancelled { reason: Evicted }`). If nothing pending has lower
    /// priority than the incoming item, the incoming item is rejected
    /// instead.
    EvictLowest,
}

/// Configuration for a [`WorkQueue`](crate::queue::WorkQueue).
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Number of pool threads spawned by `start`. Fixed for the queue's
    /// lifetime.
    pub workers: usize,
    /// Max pending items; `None` is unbounded.
    pub capacity: Option<usize>,
    /// Policy applied when a bounded queue is full.
    pub overflow: OverflowPolicy,
    /// Default drain behavior when the queue is dropped without an
    /// explicit `stop`.
    pub drain_on_stop: bool,
    /// Worker thread name prefix; workers are named `{name}-{index}`.
    pub name: String,
    /// Worker stack size, forwarded to `std::thread::Builder`. `None`
    /// uses the platform default.
    pub stack_size: Option<usize>,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            capacity: None,
            overflow: OverflowPolicy::Block,
            drain_on_stop: true,
            name: "offload".to_string(),
            stack_size: None,
        }
    }
}

impl WorkQueueConfig {
    /// Convenience for the common single-worker engine: one thread,
    /// strictly sequential execution in priority-then-FIFO order.
    pub fn single_worker() -> Self {
        Self {
            workers: 1,
            ..Self::default()
        }
    }
}

/// Configuration for a [`TaskletScheduler`](crate::tasklet::TaskletScheduler).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of distinct priority bands. Higher bands are served first,
    /// matching work item priority (band `priority_levels - 1` is the
    /// most urgent).
    pub priority_levels: u8,
    /// Name used in host-thread log output.
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            priority_levels: 4,
            name: "tasklets".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time execution counters for a work queue. Counters are read
/// with relaxed ordering; a snapshot may be slightly stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items that ran to a successful completion.
    pub worked: u64,
    /// Items whose callable returned an error or panicked.
    pub failed: u64,
    /// Items currently executing on a worker.
    pub in_flight: u64,
}
