// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! FIFO wait queues of parked jobs.
//!
//! Used for job-completion waiters and for channel readers/writers. The
//! owner supplies the locking: a channel keeps its queues under the channel
//! lock, a job keeps its completion waiters under a dedicated lock.

use std::collections::VecDeque;

use crate::job::Handle;

#[derive(Debug, Default)]
pub struct WaitQueue {
    handles: VecDeque<Handle>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parked job. `handle` must come from parking (see
    /// [`JobContext::sleep_on`](crate::JobContext::sleep_on)).
    ///
    /// Entries that can no longer wake their job are dropped first, so a
    /// queue nobody wakes from stays bounded by the jobs parked on it now.
    pub fn sleep_on(&mut self, handle: Handle) {
        self.handles.retain(Handle::is_current);
        self.handles.push_back(handle);
    }

    /// Requeue exactly one waiter.
    ///
    /// Stale entries (recycled job, or a park superseded by a later step)
    /// are discarded until one job is actually woken. Returns false if the
    /// queue ran dry first.
    pub fn wakeup(&mut self) -> bool {
        while let Some(handle) = self.handles.pop_front() {
            if handle.wake() {
                return true;
            }
        }
        false
    }

    /// Requeue every waiter. Returns how many were woken.
    pub fn wake_all(&mut self) -> usize {
        let mut woken = 0;
        while self.wakeup() {
            woken += 1;
        }
        woken
    }

    /// Entries held, including stale ones not yet pruned.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Entries that would still wake their job.
    pub fn live(&self) -> usize {
        self.handles.iter().filter(|h| h.is_current()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub(crate) fn contains(&self, handle: &Handle) -> bool {
        self.handles.iter().any(|h| h == handle)
    }
}
