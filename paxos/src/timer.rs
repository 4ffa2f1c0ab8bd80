//! Deferred callbacks.
//!
//! Replicas never sleep. When a key instance wants to retry later it allocates a [`TimerHandle`] and asks the runtime,
//! through an [`Action::Schedule`](crate::message::Action::Schedule), to call it back. A [`TimerQueue`] is the
//! runtime side of that contract: it orders pending timers by deadline and supports cancellation by handle.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

/// Names one scheduled callback. Handles are never reused by a replica, so a callback for a handle its key instance no
/// longer holds is recognisably stale.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Pending timers ordered by deadline.
pub struct TimerQueue<T> {
    by_deadline: BTreeMap<(Instant, TimerHandle), T>,
    deadlines: HashMap<TimerHandle, Instant>,
}

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        TimerHandle(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "timer {}", self.0)
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Schedules `task` under `handle` at `deadline`, replacing any task already scheduled under `handle`.
    pub fn schedule(&mut self, handle: TimerHandle, deadline: Instant, task: T) {
        self.cancel(handle);
        self.deadlines.insert(handle, deadline);
        self.by_deadline.insert((deadline, handle), task);
    }

    /// Cancels the task scheduled under `handle`, returning it if it had not fired yet.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        let deadline = self.deadlines.remove(&handle)?;
        self.by_deadline.remove(&(deadline, handle))
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.by_deadline.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Removes and returns the earliest task whose deadline is not after `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, T)> {
        let &(deadline, handle) = self.by_deadline.keys().next()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&handle);
        let task = self.by_deadline.remove(&(deadline, handle))?;
        Some((handle, task))
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
