// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline-ordered run queues.
//!
//! One global queue contested by every worker, plus a private queue per
//! worker for sticky jobs. Both keep jobs sorted by ascending deadline,
//! FIFO among equal deadlines.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{JobClass, JobRef, JobStatus};
use crate::error::fatal;

/// Deadline-sorted list of jobs. Also a worker's per-pass running/expired list.
#[derive(Debug, Default)]
pub(crate) struct RunList {
    jobs: VecDeque<JobRef>,
}

impl RunList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert before the first job with a strictly greater deadline.
    pub fn insert(&mut self, job: JobRef) {
        let deadline = job.deadline();
        let at = self.jobs.partition_point(|j| j.deadline() <= deadline);
        self.jobs.insert(at, job);
    }

    pub fn pop_front(&mut self) -> Option<JobRef> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    #[cfg(test)]
    pub fn deadlines(&self) -> Vec<u32> {
        self.jobs.iter().map(|j| j.deadline()).collect()
    }
}

thread_local! {
    /// (scheduler id, worker index) of the current thread, if it is a worker.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Marks the current thread as a worker until dropped.
pub(crate) struct WorkerGuard {
    prev: Option<(usize, usize)>,
}

pub(crate) fn enter_worker(owner: usize, index: usize) -> WorkerGuard {
    let prev = CURRENT_WORKER.with(|c| c.replace(Some((owner, index))));
    WorkerGuard { prev }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.with(|c| c.set(self.prev));
    }
}

fn current_worker(owner: usize) -> Option<usize> {
    CURRENT_WORKER.with(|c| match c.get() {
        Some((id, index)) if id == owner => Some(index),
        _ => None,
    })
}

/// Global and sticky run queues of one scheduler.
pub(crate) struct JobQueue {
    owner: usize,
    global: Mutex<RunList>,
    /// Signalled on every insert; sticky inserts notify all so the pinned
    /// worker is among the woken.
    available: Condvar,
    sticky: Vec<Mutex<RunList>>,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new(owner: usize, workers: usize) -> Self {
        Self {
            owner,
            global: Mutex::new(RunList::new()),
            available: Condvar::new(),
            sticky: (0..workers).map(|_| Mutex::new(RunList::new())).collect(),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a freshly submitted or blocked job.
    ///
    /// Any other state means the job is already owned by a queue or a
    /// worker, which is fatal.
    #[track_caller]
    pub fn insert(&self, job: JobRef) {
        if let Err(status) = job.transition(&[JobStatus::New, JobStatus::Blocked], JobStatus::Waiting) {
            fatal(format_args!(
                "insert of {} in state {:?} (expected New or Blocked)",
                job.id(),
                status
            ));
        }
        self.enqueue(job);
    }

    /// Queue a job already moved to Waiting by its waker.
    pub fn enqueue(&self, job: JobRef) {
        if job.class() == JobClass::Sticky {
            let target = job.pinned().or_else(|| current_worker(self.owner));
            if let Some(worker) = target.filter(|&w| w < self.sticky.len()) {
                job.pin(worker);
                self.sticky[worker].lock().insert(job);
                // Taken so a worker between its empty check and its wait
                // cannot miss this notification.
                let _global = self.global.lock();
                self.available.notify_all();
                return;
            }
        }
        self.global.lock().insert(job);
        self.available.notify_one();
    }

    /// Next job for `worker`: its sticky queue first, then the global head.
    ///
    /// With `timeout`, waits up to that long for the global queue to fill;
    /// without, returns immediately.
    pub fn dequeue(&self, worker: usize, timeout: Option<Duration>) -> Option<JobRef> {
        if let Some(job) = self.pop_sticky(worker) {
            return Some(job);
        }
        let mut global = self.global.lock();
        if let Some(job) = global.pop_front() {
            return Some(self.claim(job, worker));
        }
        let timeout = timeout?;
        if self.is_closed() {
            return None;
        }
        if let Some(job) = self.pop_sticky(worker) {
            return Some(job);
        }
        self.available.wait_for(&mut global, timeout);
        if let Some(job) = global.pop_front() {
            return Some(self.claim(job, worker));
        }
        drop(global);
        self.pop_sticky(worker)
    }

    fn pop_sticky(&self, worker: usize) -> Option<JobRef> {
        self.sticky.get(worker)?.lock().pop_front()
    }

    fn claim(&self, job: JobRef, worker: usize) -> JobRef {
        if job.class() == JobClass::Sticky {
            job.pin(worker);
        }
        job
    }

    /// Stop blocking dequeues; idle workers return immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _global = self.global.lock();
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Jobs waiting in the global and sticky queues.
    pub fn len(&self) -> usize {
        let sticky: usize = self.sticky.iter().map(|q| q.lock().len()).sum();
        self.global.lock().len() + sticky
    }

    /// Drop everything still queued. Returns how many jobs were discarded.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        let mut global = self.global.lock();
        while global.pop_front().is_some() {
            dropped += 1;
        }
        drop(global);
        for q in &self.sticky {
            let mut q = q.lock();
            while q.pop_front().is_some() {
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fibre::{from_fn, FibreCell};
    use crate::job::{JobCell, JobIds};
    use std::sync::{Arc, Weak};

    fn job(ids: &JobIds, deadline: u32, class: JobClass) -> JobRef {
        let cell = Arc::new(JobCell::new(0, Weak::new()));
        cell.reinit(ids.next(), deadline, class, Box::new(FibreCell::new(from_fn(|_| {}))));
        cell
    }

    #[test]
    fn run_list_orders_by_deadline_fifo_on_ties() {
        let ids = JobIds::new();
        let mut list = RunList::new();
        let first_one = job(&ids, 1, JobClass::CpuBound);
        let second_one = job(&ids, 1, JobClass::CpuBound);
        list.insert(job(&ids, 5, JobClass::CpuBound));
        list.insert(first_one.clone());
        list.insert(job(&ids, 3, JobClass::CpuBound));
        list.insert(second_one.clone());
        assert_eq!(list.deadlines(), vec![1, 1, 3, 5]);
        assert_eq!(list.pop_front().unwrap().id(), first_one.id());
        assert_eq!(list.pop_front().unwrap().id(), second_one.id());
    }

    #[test]
    fn global_dequeue_follows_deadline_order() {
        let ids = JobIds::new();
        let q = JobQueue::new(7, 1);
        for d in [9, 2, 5] {
            q.insert(job(&ids, d, JobClass::CpuBound));
        }
        let order: Vec<u32> = std::iter::from_fn(|| q.dequeue(0, None))
            .map(|j| j.deadline())
            .collect();
        assert_eq!(order, vec![2, 5, 9]);
    }

    #[test]
    fn insert_sets_waiting() {
        let ids = JobIds::new();
        let q = JobQueue::new(7, 1);
        let j = job(&ids, 1, JobClass::CpuBound);
        q.insert(j.clone());
        assert_eq!(j.status(), JobStatus::Waiting);
    }

    #[test]
    #[should_panic(expected = "expected New or Blocked")]
    fn double_insert_is_fatal() {
        let ids = JobIds::new();
        let q = JobQueue::new(7, 1);
        let j = job(&ids, 1, JobClass::CpuBound);
        q.insert(j.clone());
        q.insert(j);
    }

    #[test]
    fn sticky_job_pins_to_first_dequeuer() {
        let ids = JobIds::new();
        let q = JobQueue::new(7, 2);
        let j = job(&ids, 1, JobClass::Sticky);
        q.insert(j.clone());
        let got = q.dequeue(1, None).unwrap();
        assert_eq!(got.pinned(), Some(1));

        // Requeued from a non-worker thread: lands on worker 1's queue.
        got.begin_step();
        got.park();
        assert!(got.try_unpark(got.epoch()));
        q.enqueue(got);
        assert!(q.dequeue(0, None).is_none());
        assert_eq!(q.dequeue(1, None).unwrap().id(), j.id());
    }

    #[test]
    fn sticky_submit_from_worker_uses_its_queue() {
        let ids = JobIds::new();
        let q = JobQueue::new(7, 3);
        let _guard = enter_worker(7, 2);
        q.insert(job(&ids, 1, JobClass::Sticky));
        assert!(q.dequeue(0, None).is_none());
        assert!(q.dequeue(2, None).is_some());
    }

    #[test]
    fn worker_guard_is_scoped_to_owner() {
        {
            let _guard = enter_worker(1, 4);
            assert_eq!(current_worker(1), Some(4));
            assert_eq!(current_worker(2), None);
        }
        assert_eq!(current_worker(1), None);
    }

    #[test]
    fn timed_dequeue_returns_none_when_idle() {
        let q = JobQueue::new(7, 1);
        let start = std::time::Instant::now();
        assert!(q.dequeue(0, Some(Duration::from_millis(20))).is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn timed_dequeue_wakes_on_insert() {
        let ids = Arc::new(JobIds::new());
        let q = Arc::new(JobQueue::new(7, 1));
        let q2 = q.clone();
        let ids2 = ids.clone();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            q2.insert(job(&ids2, 3, JobClass::CpuBound));
        });
        let got = q.dequeue(0, Some(Duration::from_secs(5)));
        producer.join().unwrap();
        assert_eq!(got.map(|j| j.deadline()), Some(3));
    }

    #[test]
    fn closed_queue_does_not_block() {
        let q = JobQueue::new(7, 1);
        q.close();
        let start = std::time::Instant::now();
        assert!(q.dequeue(0, Some(Duration::from_secs(5))).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
