// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Outstanding-jobs-per-deadline counter.
//!
//! Every submitted job bumps its deadline's count; every recycled job
//! drops it. A native thread can block until a deadline's count reaches
//! zero, which is how frame boundaries wait for background work.
//!
//! Absent deadlines are ambiguous. A deadline below the earliest one still
//! outstanding is taken as already retired, which holds only if jobs are
//! submitted in non-decreasing deadline order; a late submission with a
//! smaller deadline is not waited for. Anything else is reported as
//! [`JoinError::Unretired`] and the caller retries.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::JoinError;

#[derive(Debug)]
struct Entry {
    count: i64,
    /// Distinguishes a re-created entry from the one a waiter attached to.
    generation: u64,
    waiters: usize,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<u32, Entry>,
    next_generation: u64,
    idle_waiters: usize,
}

#[derive(Debug, Default)]
pub struct DeadlineHistogram {
    state: Mutex<State>,
    retired: Condvar,
}

impl DeadlineHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjust `deadline`'s count by `delta`. An entry whose count drops to
    /// zero or below is removed and its waiters released.
    pub fn update(&self, deadline: u32, delta: i64) {
        let mut state = self.state.lock();
        let State {
            entries,
            next_generation,
            idle_waiters,
        } = &mut *state;
        let entry = entries.entry(deadline).or_insert_with(|| {
            *next_generation += 1;
            Entry {
                count: 0,
                generation: *next_generation,
                waiters: 0,
            }
        });
        entry.count += delta;
        if entry.count > 0 {
            return;
        }
        let waiters = entry.waiters;
        entries.remove(&deadline);
        tracing::trace!(deadline, "deadline retired");
        if waiters > 0 || (*idle_waiters > 0 && entries.is_empty()) {
            self.retired.notify_all();
        }
    }

    /// Block until every job tagged `deadline` has finished.
    pub fn wait(&self, deadline: u32) -> Result<(), JoinError> {
        self.wait_until(deadline, None)
    }

    /// [`wait`](Self::wait) bounded by `timeout`.
    pub fn wait_timeout(&self, deadline: u32, timeout: Duration) -> Result<(), JoinError> {
        self.wait_until(deadline, Some(Instant::now() + timeout))
    }

    fn wait_until(&self, deadline: u32, until: Option<Instant>) -> Result<(), JoinError> {
        let mut state = self.state.lock();
        let generation = match state.entries.get_mut(&deadline) {
            Some(entry) => {
                entry.waiters += 1;
                entry.generation
            }
            None => {
                return match state.entries.keys().next() {
                    None => Ok(()),
                    Some(&earliest) if earliest > deadline => Ok(()),
                    Some(&earliest) => Err(JoinError::Unretired { deadline, earliest }),
                };
            }
        };

        let current = |state: &State| {
            state
                .entries
                .get(&deadline)
                .is_some_and(|e| e.generation == generation)
        };
        while current(&*state) {
            match until {
                None => self.retired.wait(&mut state),
                Some(until) => {
                    if self.retired.wait_until(&mut state, until).timed_out() && current(&*state) {
                        if let Some(entry) = state.entries.get_mut(&deadline) {
                            entry.waiters -= 1;
                        }
                        return Err(JoinError::TimedOut { deadline });
                    }
                }
            }
        }
        Ok(())
    }

    /// Block until no deadline is outstanding. False on timeout.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let until = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.idle_waiters += 1;
        while !state.entries.is_empty() {
            if self.retired.wait_until(&mut state, until).timed_out() {
                break;
            }
        }
        state.idle_waiters -= 1;
        state.entries.is_empty()
    }

    /// Outstanding jobs for `deadline`.
    pub fn count(&self, deadline: u32) -> i64 {
        self.state
            .lock()
            .entries
            .get(&deadline)
            .map_or(0, |e| e.count)
    }

    pub fn earliest(&self) -> Option<u32> {
        self.state.lock().entries.keys().next().copied()
    }

    /// Number of deadlines with outstanding jobs.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    #[cfg(test)]
    fn waiters(&self, deadline: u32) -> usize {
        self.state
            .lock()
            .entries
            .get(&deadline)
            .map_or(0, |e| e.waiters)
    }
}
