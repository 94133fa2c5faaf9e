//! The synchronized item queue: a bounded, priority-then-FIFO buffer of
//! pending work cells with blocking hand-off semantics.
//!
//! Pop order is highest priority first, submission order within a
//! priority. Each successful push/pop pair is a single hand-off; a cell
//! leaves the buffer exactly once. Queues are expected to stay small (a
//! backlog is visible backpressure, not a feature), so selection is a
//! linear scan rather than a heap.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::item::WorkCell;
use crate::model::{OverflowPolicy, State, WorkId};

/// Outcome of a pop. Timeout is a normal control-flow value.
pub(crate) enum Pop {
    Item(Arc<WorkCell>),
    Timeout,
    Closed,
}

/// Outcome of a push.
pub(crate) enum Push {
    /// The item is queued. Under `EvictLowest` the displaced cell rides
    /// along so the caller can fire its cancellation notice.
    Accepted { evicted: Option<Arc<WorkCell>> },
    /// Bounded queue full: rejected outright, or the blocking wait timed
    /// out before a slot opened.
    Full,
    /// The queue was closed before the item could be queued.
    Closed,
}

struct Inner {
    items: VecDeque<Arc<WorkCell>>,
    closed: bool,
}

pub(crate) struct SyncQueue {
    capacity: Option<usize>,
    overflow: OverflowPolicy,
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl SyncQueue {
    pub(crate) fn new(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self {
            capacity,
            overflow,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Queue a cell, honoring the overflow policy when the buffer is at
    /// capacity. `timeout` bounds a `Block` wait; `None` waits until a
    /// slot opens or the queue closes.
    pub(crate) fn push(&self, cell: Arc<WorkCell>, timeout: Option<Duration>) -> Push {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();

        loop {
            if inner.closed {
                return Push::Closed;
            }

            let full = match self.capacity {
                Some(cap) => {
                    if inner.items.len() >= cap {
                        // Cancelled tombstones still occupy slots; drop
                        // them before judging fullness.
                        inner.items.retain(|c| c.state() == State::Pending);
                    }
                    inner.items.len() >= cap
                }
                None => false,
            };

            if !full {
                inner.items.push_back(cell);
                self.not_empty.notify_one();
                return Push::Accepted { evicted: None };
            }

            match self.overflow {
                OverflowPolicy::Reject => return Push::Full,
                OverflowPolicy::EvictLowest => {
                    let victim = worst_index(&inner.items)
                        .filter(|&i| inner.items[i].priority < cell.priority)
                        .and_then(|i| inner.items.remove(i));
                    // No strictly-lower-priority victim: the newcomer
                    // loses instead.
                    let Some(victim) = victim else {
                        return Push::Full;
                    };
                    inner.items.push_back(cell);
                    self.not_empty.notify_one();
                    return Push::Accepted {
                        evicted: Some(victim),
                    };
                }
                OverflowPolicy::Block => match deadline {
                    None => {
                        inner = self.not_full.wait(inner).unwrap();
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            return Push::Full;
                        }
                        let (guard, _) = self
                            .not_full
                            .wait_timeout(inner, deadline - now)
                            .unwrap();
                        inner = guard;
                    }
                },
            }
        }
    }

    /// Take the next cell in priority-then-FIFO order, waiting up to
    /// `timeout` (`None` waits indefinitely). After `close(drain=true)`
    /// items keep flowing until the buffer is empty, then `Closed`.
    pub(crate) fn pop(&self, timeout: Option<Duration>) -> Pop {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(idx) = best_index(&inner.items) {
                let cell = inner.items.remove(idx).unwrap();
                self.not_full.notify_one();
                return Pop::Item(cell);
            }

            if inner.closed {
                return Pop::Closed;
            }

            match deadline {
                None => {
                    inner = self.not_empty.wait(inner).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Pop::Timeout;
                    }
                    let (guard, _) = self
                        .not_empty
                        .wait_timeout(inner, deadline - now)
                        .unwrap();
                    inner = guard;
                }
            }
        }
    }

    /// Close the queue. With `drain`, pending cells remain for workers to
    /// finish; without, they are handed back for cancellation notices.
    /// Wakes every blocked push and pop either way.
    pub(crate) fn close(&self, drain: bool) -> Vec<Arc<WorkCell>> {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        let leftovers = if drain {
            Vec::new()
        } else {
            inner.items.drain(..).collect()
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        leftovers
    }

    /// Pending count snapshot. May include cancelled tombstones not yet
    /// skipped by a worker.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }
}

/// Index of the next cell to serve: highest priority, oldest id within a
/// priority.
fn best_index(items: &VecDeque<Arc<WorkCell>>) -> Option<usize> {
    let mut best: Option<(usize, i32, WorkId)> = None;
    for (i, cell) in items.iter().enumerate() {
        let better = match best {
            None => true,
            Some((_, p, id)) => cell.priority > p || (cell.priority == p && cell.id < id),
        };
        if better {
            best = Some((i, cell.priority, cell.id));
        }
    }
    best.map(|(i, _, _)| i)
}

/// Index of the eviction victim: lowest priority, youngest id within a
/// priority.
fn worst_index(items: &VecDeque<Arc<WorkCell>>) -> Option<usize> {
    let mut worst: Option<(usize, i32, WorkId)> = None;
    for (i, cell) in items.iter().enumerate() {
        let worse = match worst {
            None => true,
            Some((_, p, id)) => cell.priority < p || (cell.priority == p && cell.id > id),
        };
        if worse {
            worst = Some((i, cell.priority, cell.id));
        }
    }
    worst.map(|(i, _, _)| i)
}
