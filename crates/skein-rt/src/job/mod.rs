// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Job records and weak handles.
//!
//! A job cell is recycled through the [`pool`]; every incarnation gets a
//! fresh [`JobId`], so a [`Handle`] to an earlier incarnation is detectably
//! stale instead of aliasing a different logical job.
//!
//! Components:
//! - `pool`   — recycling allocator for job cells
//! - `queue`  — deadline-ordered global and sticky run queues
//! - `region` — per-job scratch arena

pub mod pool;
pub mod queue;
pub mod region;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::fibre::ErasedFibre;
use crate::waitqueue::WaitQueue;

use self::queue::JobQueue;
use self::region::Region;

/// Identity of one job incarnation. Never reused within a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    /// Identity of a cell sitting in the free pool.
    pub const NONE: JobId = JobId(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Monotonic, time-seeded id source.
#[derive(Debug)]
pub(crate) struct JobIds {
    next: AtomicU64,
}

impl JobIds {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Self {
            // Keep headroom so the counter never wraps back onto NONE.
            next: AtomicU64::new((seed >> 8).max(1)),
        }
    }

    pub fn next(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// Job lifecycle states. Also the value a fibre step returns.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Allocated, not yet queued.
    New = 0,
    /// In a run queue or a worker's pass list.
    Waiting = 1,
    /// Executing on a worker. As a step result: self-yield, run again this pass.
    Running = 2,
    /// Parked on one or more wait queues.
    Blocked = 3,
    /// Step result: run again next pass.
    Yielded = 4,
    /// Step result: finished (cleanup path).
    Exited = 5,
    /// Finished and recycled (or about to be).
    Done = 6,
    /// Reported by [`Handle::status`] once cancellation is requested; never
    /// stored or returned by a step.
    Cancelled = 7,
}

impl JobStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Waiting,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Yielded,
            5 => Self::Exited,
            6 => Self::Done,
            _ => Self::Cancelled,
        }
    }
}

/// Scheduling class.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JobClass {
    #[default]
    CpuBound = 0,
    IoBound = 1,
    /// Pinned to the worker that first dequeues it.
    Sticky = 2,
}

impl JobClass {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::IoBound,
            2 => Self::Sticky,
            _ => Self::CpuBound,
        }
    }
}

const STATUS_BITS: u32 = 8;
const STATUS_MASK: u64 = 0xff;
const NO_WORKER: usize = usize::MAX;

fn pack(epoch: u64, status: JobStatus) -> u64 {
    (epoch << STATUS_BITS) | status as u64
}

fn unpack(word: u64) -> (u64, JobStatus) {
    (word >> STATUS_BITS, JobStatus::from_u8((word & STATUS_MASK) as u8))
}

/// Fibre and scratch arena; locked for the duration of a step.
pub(crate) struct JobBody {
    pub fibre: Option<Box<dyn ErasedFibre>>,
    pub region: Region,
}

/// A pooled job record.
///
/// `state` packs the park epoch with the status so a wake can verify both
/// in one compare-exchange. The epoch advances at the start of every step,
/// which makes parks left over from earlier steps (e.g. the other operands
/// of a chanmux) inert.
pub(crate) struct JobCell {
    index: usize,
    id: AtomicU64,
    state: AtomicU64,
    deadline: AtomicU32,
    class: AtomicU8,
    pinned: AtomicUsize,
    pub cancel: CancelToken,
    pub body: Mutex<JobBody>,
    /// Jobs parked on this job's completion.
    pub waiters: Mutex<WaitQueue>,
    queue: Weak<JobQueue>,
}

pub(crate) type JobRef = Arc<JobCell>;

impl fmt::Debug for JobCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCell")
            .field("index", &self.index)
            .field("id", &self.id())
            .field("status", &self.status())
            .field("deadline", &self.deadline())
            .field("class", &self.class())
            .finish()
    }
}

impl JobCell {
    pub fn new(index: usize, queue: Weak<JobQueue>) -> Self {
        Self {
            index,
            id: AtomicU64::new(JobId::NONE.0),
            state: AtomicU64::new(pack(0, JobStatus::Done)),
            deadline: AtomicU32::new(0),
            class: AtomicU8::new(JobClass::CpuBound as u8),
            pinned: AtomicUsize::new(NO_WORKER),
            cancel: CancelToken::new(),
            body: Mutex::new(JobBody {
                fibre: None,
                region: Region::new(),
            }),
            waiters: Mutex::new(WaitQueue::new()),
            queue,
        }
    }

    /// Start a new incarnation. The id is published last.
    pub fn reinit(&self, id: JobId, deadline: u32, class: JobClass, fibre: Box<dyn ErasedFibre>) {
        self.body.lock().fibre = Some(fibre);
        self.cancel.reset();
        self.pinned.store(NO_WORKER, Ordering::Relaxed);
        self.deadline.store(deadline, Ordering::Relaxed);
        self.class.store(class as u8, Ordering::Relaxed);
        let (epoch, _) = unpack(self.state.load(Ordering::Acquire));
        self.state
            .store(pack(epoch + 1, JobStatus::New), Ordering::Release);
        self.id.store(id.0, Ordering::Release);
    }

    pub fn clear_id(&self) {
        self.id.store(JobId::NONE.0, Ordering::Release);
    }

    #[cfg(test)]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> JobId {
        JobId(self.id.load(Ordering::Acquire))
    }

    pub fn status(&self) -> JobStatus {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    pub fn epoch(&self) -> u64 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    pub fn deadline(&self) -> u32 {
        self.deadline.load(Ordering::Relaxed)
    }

    pub fn class(&self) -> JobClass {
        JobClass::from_u8(self.class.load(Ordering::Relaxed))
    }

    pub fn pinned(&self) -> Option<usize> {
        match self.pinned.load(Ordering::Acquire) {
            NO_WORKER => None,
            w => Some(w),
        }
    }

    pub fn pin(&self, worker: usize) {
        let _ = self.pinned.compare_exchange(
            NO_WORKER,
            worker,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn queue(&self) -> Option<Arc<JobQueue>> {
        self.queue.upgrade()
    }

    /// Move from any of `from` to `to`, keeping the epoch.
    /// Returns the observed status on failure.
    pub fn transition(&self, from: &[JobStatus], to: JobStatus) -> Result<JobStatus, JobStatus> {
        let mut word = self.state.load(Ordering::Acquire);
        loop {
            let (epoch, status) = unpack(word);
            if !from.contains(&status) {
                return Err(status);
            }
            match self.state.compare_exchange_weak(
                word,
                pack(epoch, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(status),
                Err(actual) => word = actual,
            }
        }
    }

    /// Enter a step: bump the epoch and mark Running.
    pub fn begin_step(&self) -> u64 {
        let mut word = self.state.load(Ordering::Acquire);
        loop {
            let (epoch, _) = unpack(word);
            let next = pack(epoch + 1, JobStatus::Running);
            match self.state.compare_exchange_weak(word, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return epoch + 1,
                Err(actual) => word = actual,
            }
        }
    }

    /// Mark Blocked and return a handle a waker can use to requeue it.
    pub fn park(self: &Arc<Self>) -> Handle {
        let _ = self.transition(&[JobStatus::Running, JobStatus::Blocked], JobStatus::Blocked);
        self.handle()
    }

    /// Still Blocked from the park taken in step `epoch`.
    pub fn is_parked_at(&self, epoch: u64) -> bool {
        self.state.load(Ordering::Acquire) == pack(epoch, JobStatus::Blocked)
    }

    /// Blocked -> Waiting, only if still parked in step `epoch`.
    pub fn try_unpark(&self, epoch: u64) -> bool {
        self.state
            .compare_exchange(
                pack(epoch, JobStatus::Blocked),
                pack(epoch, JobStatus::Waiting),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn handle(self: &Arc<Self>) -> Handle {
        Handle {
            id: self.id(),
            epoch: self.epoch(),
            job: Arc::clone(self),
        }
    }
}

/// Weak reference to one job incarnation.
///
/// Valid while the job it was taken from has not been recycled. Handles
/// produced by parking also carry the step epoch and can requeue the job
/// at most once.
#[derive(Clone)]
pub struct Handle {
    id: JobId,
    epoch: u64,
    job: JobRef,
}

impl Handle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.id != JobId::NONE && self.job.id() == self.id
    }

    /// Current status, or `None` once the job has been recycled.
    ///
    /// A job with a pending cancellation reports `Cancelled` until it
    /// finishes.
    pub fn status(&self) -> Option<JobStatus> {
        let status = match self.job.status() {
            JobStatus::Done => JobStatus::Done,
            _ if self.job.cancel.is_cancelled() => JobStatus::Cancelled,
            status => status,
        };
        self.is_valid().then_some(status)
    }

    pub fn deadline(&self) -> Option<u32> {
        let deadline = self.job.deadline();
        self.is_valid().then_some(deadline)
    }

    pub(crate) fn job(&self) -> &JobRef {
        &self.job
    }

    /// The park this handle records can still wake the job.
    pub(crate) fn is_current(&self) -> bool {
        self.is_valid() && self.job.is_parked_at(self.epoch)
    }

    /// Requeue the job if this handle's park is still current.
    pub(crate) fn wake(&self) -> bool {
        if !self.is_valid() || !self.job.try_unpark(self.epoch) {
            return false;
        }
        match self.job.queue() {
            Some(queue) => {
                tracing::trace!(job = %self.id, "woken");
                queue.enqueue(Arc::clone(&self.job));
                true
            }
            None => false,
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.epoch == other.epoch
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fibre::{from_fn, FibreCell};

    fn cell() -> JobRef {
        Arc::new(JobCell::new(0, Weak::new()))
    }

    fn live(ids: &JobIds) -> JobRef {
        let job = cell();
        job.reinit(ids.next(), 4, JobClass::CpuBound, Box::new(FibreCell::new(from_fn(|_| {}))));
        job
    }

    #[test]
    fn ids_are_monotonic_and_nonzero() {
        let ids = JobIds::new();
        let a = ids.next();
        let b = ids.next();
        assert!(a != JobId::NONE);
        assert!(b > a);
    }

    #[test]
    fn recycled_cell_invalidates_handle() {
        let ids = JobIds::new();
        let job = live(&ids);
        let h = job.handle();
        assert!(h.is_valid());
        assert_eq!(h.status(), Some(JobStatus::New));

        job.clear_id();
        assert!(!h.is_valid());
        assert_eq!(h.status(), None);

        job.reinit(ids.next(), 1, JobClass::IoBound, Box::new(FibreCell::new(from_fn(|_| {}))));
        assert!(!h.is_valid());
        assert_eq!(job.class(), JobClass::IoBound);
    }

    #[test]
    fn unpark_requires_matching_epoch() {
        let ids = JobIds::new();
        let job = live(&ids);
        let epoch = job.begin_step();
        let h = job.park();
        assert_eq!(job.status(), JobStatus::Blocked);
        assert!(!job.try_unpark(epoch - 1));
        assert!(job.try_unpark(epoch));
        assert_eq!(job.status(), JobStatus::Waiting);
        // Second wake on the same park is a no-op.
        assert!(!job.try_unpark(epoch));
        drop(h);
    }

    #[test]
    fn stale_park_cannot_wake_later_step() {
        let ids = JobIds::new();
        let job = live(&ids);
        let first = job.begin_step();
        job.park();
        assert!(job.try_unpark(first));
        job.begin_step();
        job.park();
        assert!(!job.try_unpark(first));
        assert_eq!(job.status(), JobStatus::Blocked);
    }

    #[test]
    fn transition_reports_observed_status() {
        let ids = JobIds::new();
        let job = live(&ids);
        assert_eq!(
            job.transition(&[JobStatus::Blocked], JobStatus::Waiting),
            Err(JobStatus::New)
        );
        assert_eq!(
            job.transition(&[JobStatus::New], JobStatus::Waiting),
            Ok(JobStatus::New)
        );
    }

    #[test]
    fn parked_handle_is_current_until_woken() {
        let ids = JobIds::new();
        let job = live(&ids);
        job.begin_step();
        let h = job.park();
        assert!(h.is_current());
        assert!(job.try_unpark(job.epoch()));
        assert!(!h.is_current());
        job.begin_step();
        let again = job.park();
        assert!(!h.is_current());
        assert!(again.is_current());
    }

    #[test]
    fn cancelled_job_reports_cancelled_until_done() {
        let ids = JobIds::new();
        let job = live(&ids);
        let h = job.handle();
        job.begin_step();
        job.park();
        assert_eq!(h.status(), Some(JobStatus::Blocked));
        job.cancel.cancel();
        assert_eq!(h.status(), Some(JobStatus::Cancelled));
        job.begin_step();
        job.transition(&[JobStatus::Running], JobStatus::Done).unwrap();
        assert_eq!(h.status(), Some(JobStatus::Done));
    }

    #[test]
    fn pin_is_first_writer_wins() {
        let job = cell();
        assert_eq!(job.pinned(), None);
        job.pin(2);
        job.pin(5);
        assert_eq!(job.pinned(), Some(2));
    }
}
