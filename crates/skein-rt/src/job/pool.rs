// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Recycling allocator for job cells.
//!
//! Cells are never released while the scheduler lives: a finished job's
//! fibre is dropped, its arena reclaimed, its id cleared, and the cell goes
//! back on the free list for the next `alloc`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::queue::JobQueue;
use super::{JobBody, JobCell, JobClass, JobIds, JobRef, JobStatus};
use crate::error::fatal;
use crate::fibre::ErasedFibre;

pub(crate) struct JobPool {
    free: Mutex<Vec<JobRef>>,
    allocated: AtomicUsize,
    ids: JobIds,
    queue: Weak<JobQueue>,
}

impl JobPool {
    pub fn new(queue: Weak<JobQueue>) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            ids: JobIds::new(),
            queue,
        }
    }

    /// Grow the free list by `n` fresh cells.
    pub fn prealloc(&self, n: usize) {
        let mut free = self.free.lock();
        free.reserve(n);
        for _ in 0..n {
            free.push(self.fresh());
        }
    }

    fn fresh(&self) -> JobRef {
        let index = self.allocated.fetch_add(1, Ordering::Relaxed);
        Arc::new(JobCell::new(index, self.queue.clone()))
    }

    /// Pop a recycled cell (or make one) and start a new incarnation in it.
    pub fn alloc(&self, fibre: Box<dyn ErasedFibre>, deadline: u32, class: JobClass) -> JobRef {
        let job = self.free.lock().pop().unwrap_or_else(|| self.fresh());
        job.reinit(self.ids.next(), deadline, class, fibre);
        job
    }

    /// Return a finished job to the free list.
    ///
    /// `body` is the job's own body, already locked by the caller.
    #[track_caller]
    pub fn free(&self, job: &JobRef, body: &mut JobBody) {
        let status = job.status();
        if status != JobStatus::Done {
            fatal(format_args!("free of {} in state {:?}", job.id(), status));
        }
        // The id is cleared under the waiter lock; `Scheduler::cancel`
        // validates its handle under the same lock.
        let waiters = job.waiters.lock();
        if !waiters.is_empty() {
            fatal(format_args!("free of {} with {} waiter(s)", job.id(), waiters.len()));
        }
        job.clear_id();
        drop(waiters);
        body.fibre = None;
        body.region.reclaim();
        self.free.lock().push(Arc::clone(job));
    }

    /// Cells ever created.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Cells currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use crate::fibre::{from_fn, FibreCell};

    fn noop() -> Box<dyn ErasedFibre> {
        Box::new(FibreCell::new(from_fn(|_| {})))
    }

    fn finish(pool: &JobPool, job: &JobRef) {
        job.begin_step();
        job.transition(&[JobStatus::Running], JobStatus::Done).unwrap();
        let mut body = job.body.lock();
        pool.free(job, &mut body);
    }

    #[test]
    fn cells_are_recycled_with_new_ids() {
        let pool = JobPool::new(Weak::new());
        let a = pool.alloc(noop(), 1, JobClass::CpuBound);
        let first_id = a.id();
        let index = a.index();
        finish(&pool, &a);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(a.id(), JobId::NONE);

        let b = pool.alloc(noop(), 2, JobClass::IoBound);
        assert_eq!(b.index(), index);
        assert_ne!(b.id(), first_id);
        assert_eq!(b.status(), JobStatus::New);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn prealloc_fills_free_list() {
        let pool = JobPool::new(Weak::new());
        pool.prealloc(4);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.allocated(), 4);
        let _ = pool.alloc(noop(), 0, JobClass::CpuBound);
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.allocated(), 4);
    }

    #[test]
    fn free_reclaims_region() {
        let pool = JobPool::new(Weak::new());
        let job = pool.alloc(noop(), 1, JobClass::CpuBound);
        job.body.lock().region.alloc(64);
        finish(&pool, &job);
        let body = job.body.lock();
        assert_eq!(body.region.used(), 0);
        assert!(body.region.capacity() >= 64);
        assert!(body.fibre.is_none());
    }

    #[test]
    #[should_panic(expected = "in state New")]
    fn free_of_unfinished_job_is_fatal() {
        let pool = JobPool::new(Weak::new());
        let job = pool.alloc(noop(), 1, JobClass::CpuBound);
        let mut body = job.body.lock();
        pool.free(&job, &mut body);
    }
}
