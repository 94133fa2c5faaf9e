//! Error types for offload.
//!
//! Only structural misuse and queue-level rejections live here. A timeout
//! on a bounded wait is a normal outcome and is reported through the
//! calling operation's return enum, never as an `Error`. Failures inside
//! submitted work are delivered through the item's completion sink.

use thiserror::Error;

use crate::model::{TaskletId, WorkId};

#[derive(Debug, Error)]
pub enum Error {
    /// The queue is at capacity and the overflow policy rejected the item.
    #[error("queue is full")]
    QueueFull,

    /// The queue (or scheduler) has been stopped; no further submissions.
    #[error("queue is closed")]
    QueueClosed,

    /// `start` was called on an already-running work queue, or a second
    /// host thread tried to run a scheduler that already has one.
    #[error("already started")]
    AlreadyStarted,

    /// `cancel` arrived after the item left `Pending`. The work either ran
    /// or is running; the completion sink tells the rest of the story.
    #[error("work item {0} already committed")]
    AlreadyCommitted(WorkId),

    /// The tasklet id is not registered with this scheduler.
    #[error("unknown tasklet {0}")]
    UnknownTasklet(TaskletId),

    /// Tasklet priority band outside the configured number of levels.
    #[error("priority band {band} out of range ({levels} levels configured)")]
    InvalidPriority { band: u8, levels: u8 },

    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
