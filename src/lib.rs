//! # offload
//!
//! A lightweight task-execution layer: a synchronized work queue executed
//! by a pool of worker threads, and a cooperative tasklet scheduler that
//! multiplexes many small step machines onto a single host thread.
//!
//! Submit one-shot [`Work`] to a [`WorkQueue`] to run it asynchronously;
//! register [`Tasklet`](tasklet::Tasklet)s with a
//! [`TaskletScheduler`](tasklet::TaskletScheduler) for workloads too
//! numerous or short-lived to deserve an OS thread each. The two are
//! peers: tasklets can submit work to offload blocking operations, and
//! work items can register tasklets.
//!
//! ```no_run
//! use offload::{Work, WorkQueue, WorkQueueConfig};
//!
//! let queue = WorkQueue::new(WorkQueueConfig::default());
//! queue.start()?;
//! queue.submit(Work::from_fn(|| println!("deferred")))?;
//! queue.stop(true);
//! # Ok::<(), offload::Error>(())
//! ```

pub mod error;
pub mod event;
pub mod item;
pub mod model;
pub mod queue;
pub mod tasklet;

pub use error::{Error, Result};
pub use event::{Event, EventHook, EventKind};
pub use item::{Work, WorkHandle};
pub use model::{
    BoxError, CancelReason, Outcome, OverflowPolicy, QueueStats, SchedulerConfig, State, TaskletId,
    TaskletState, WorkId, WorkQueueConfig,
};
pub use queue::{Submitted, WorkQueue};
pub use tasklet::{NewTasklet, Signal, Step, Tasklet, TaskletScheduler, Tick};
