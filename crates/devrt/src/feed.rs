//! Per-device FIFO queues backing infeed and outfeed.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::backend::{BackendError, BackendResult};
use crate::program::Literal;
use crate::shape::Shape;

#[derive(Debug, Default)]
struct FeedState {
    entries: VecDeque<Literal>,
    closed: bool,
}

/// Bounded FIFO of literals with blocking, deadline-limited reads.
#[derive(Debug)]
pub struct FeedQueue {
    state: Mutex<FeedState>,
    ready: Condvar,
    capacity: usize,
}

impl FeedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(FeedState::default()),
            ready: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, literal: Literal) -> BackendResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(BackendError::QueueClosed);
        }
        if state.entries.len() >= self.capacity {
            return Err(BackendError::QueueFull {
                capacity: self.capacity,
            });
        }
        state.entries.push_back(literal);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    /// Pops the front entry if it has `shape`, waiting up to `timeout` for
    /// one to arrive. A front entry with a different shape stays queued and
    /// is reported as a mismatch.
    pub fn pop_matching(&self, shape: &Shape, timeout: Duration) -> BackendResult<Literal> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if let Some(front) = state.entries.front() {
                if &front.shape != shape {
                    return Err(BackendError::ShapeMismatch {
                        expected: shape.clone(),
                        found: front.shape.clone(),
                    });
                }
                if let Some(literal) = state.entries.pop_front() {
                    return Ok(literal);
                }
            }
            if state.closed {
                return Err(BackendError::QueueClosed);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(BackendError::Timeout { waited: timeout });
                    }
                    deadline - now
                }
                None => Duration::MAX,
            };
            state = self
                .ready
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Rejects further pushes and wakes all waiters. Queued entries can still
    /// be drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
