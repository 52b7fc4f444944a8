// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deadline-ordered cooperative scheduler.
//!
//! N worker threads share one deadline-sorted global queue (plus a private
//! queue each for sticky jobs). A worker runs in passes over two lists,
//! `running` and `expired`:
//!
//! 1. take at most one new job from the queues, blocking up to the idle
//!    timeout only when `running` is empty;
//! 2. run each job in `running`, lowest deadline first, to its next
//!    suspension point;
//! 3. sort it by the returned status: self-yields go back into `running`,
//!    waits and restarts go to `expired`, parked jobs are left to their
//!    wait queue, finished jobs are recycled;
//! 4. swap the lists and start the next pass.
//!
//! Every job therefore gets one attempt per pass no matter how often
//! earlier-deadline jobs yield.

use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::SchedulerConfig;
use crate::error::{fatal, InitError, JoinError};
use crate::fibre::{Fibre, FibreCell, StepEnv};
use crate::histogram::DeadlineHistogram;
use crate::job::pool::JobPool;
use crate::job::queue::{enter_worker, JobQueue, RunList};
use crate::job::{Handle, JobBody, JobClass, JobRef, JobStatus};

static NEXT_SCHEDULER: AtomicUsize = AtomicUsize::new(1);

/// State shared between the scheduler handle, its workers and running jobs.
pub(crate) struct Shared {
    pub id: usize,
    pub config: SchedulerConfig,
    pub worker_count: usize,
    pub queue: Arc<JobQueue>,
    pub pool: JobPool,
    pub histogram: DeadlineHistogram,
    pub shutdown: AtomicBool,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub workers: usize,
    /// Job records created by the pool so far.
    pub jobs_allocated: usize,
    /// Job records sitting in the free pool.
    pub jobs_free: usize,
    /// Jobs waiting in the global and sticky queues.
    pub queued: usize,
    /// Deadlines with unfinished jobs.
    pub outstanding_deadlines: usize,
}

/// A pool of worker threads running fibres.
///
/// Dropping the scheduler shuts it down; jobs that have not finished by
/// then are abandoned.
pub struct Scheduler {
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, InitError> {
        config.validate()?;
        let worker_count = config.resolved_workers();
        let id = NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed);

        let queue = Arc::new(JobQueue::new(id, worker_count));
        let pool = JobPool::new(Arc::downgrade(&queue));
        pool.prealloc(config.prealloc_jobs);

        let shared = Arc::new(Shared {
            id,
            config,
            worker_count,
            queue,
            pool,
            histogram: DeadlineHistogram::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", shared.config.thread_name_prefix, index))
                .spawn(move || worker_loop(index, &worker_shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    shared.shutdown.store(true, Ordering::Release);
                    shared.queue.close();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(InitError::SpawnWorker { index, source });
                }
            }
        }

        tracing::info!(scheduler = id, workers = worker_count, "scheduler started");
        Ok(Self {
            workers: Mutex::new(handles),
            shared,
        })
    }

    /// Default configuration with `n` workers (0 = one per core).
    pub fn with_workers(n: usize) -> Result<Self, InitError> {
        Self::new(SchedulerConfig::default().workers(n))
    }

    /// Build a job to run on this scheduler. Deadline defaults to 0.
    pub fn job<F: Fibre>(&self, fibre: F) -> JobBuilder<'_, F> {
        JobBuilder::new(&self.shared, fibre)
    }

    /// Submit a CPU-bound job with `deadline`.
    pub fn submit<F: Fibre>(&self, fibre: F, deadline: u32) -> Handle {
        self.job(fibre).deadline(deadline).submit()
    }

    /// Request cooperative cancellation.
    ///
    /// The job's next step starts on its cleanup path. A parked job is
    /// requeued so that step happens. Returns false for a stale handle or
    /// a job already cancelled.
    pub fn cancel(&self, handle: &Handle) -> bool {
        let job = handle.job();
        // Recycling clears the id under this lock, so a handle that is
        // valid here cannot flag a later incarnation.
        let _waiters = job.waiters.lock();
        if !handle.is_valid() || !job.cancel.cancel() {
            return false;
        }
        tracing::debug!(job = %handle.id(), "cancel requested");
        // Pairs with the fence in `run_step`: either this sees the park or
        // the worker sees the request.
        fence(Ordering::SeqCst);
        if job.transition(&[JobStatus::Blocked], JobStatus::Waiting).is_ok() {
            if let Some(queue) = job.queue() {
                queue.enqueue(Arc::clone(job));
            }
        }
        true
    }

    /// Status of the job behind `handle`; `None` once it has been recycled.
    pub fn status(&self, handle: &Handle) -> Option<JobStatus> {
        handle.status()
    }

    /// Block this (non-worker) thread until every job tagged `deadline`
    /// has finished and been recycled.
    ///
    /// See [`DeadlineHistogram`] for when an absent deadline counts as
    /// retired.
    pub fn join_deadline(&self, deadline: u32) -> Result<(), JoinError> {
        self.shared.histogram.wait(deadline)
    }

    /// [`join_deadline`](Self::join_deadline) bounded by `timeout`.
    pub fn join_deadline_timeout(&self, deadline: u32, timeout: Duration) -> Result<(), JoinError> {
        self.shared.histogram.wait_timeout(deadline, timeout)
    }

    /// Block until no job is outstanding. False on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.histogram.wait_empty(timeout)
    }

    pub fn histogram(&self) -> &DeadlineHistogram {
        &self.shared.histogram
    }

    pub fn workers(&self) -> usize {
        self.shared.worker_count
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            workers: self.shared.worker_count,
            jobs_allocated: self.shared.pool.allocated(),
            jobs_free: self.shared.pool.free_count(),
            queued: self.shared.queue.len(),
            outstanding_deadlines: self.shared.histogram.len(),
        }
    }

    /// Stop the workers and wait for them to exit.
    ///
    /// Workers leave at their next pass boundary; unfinished jobs are
    /// dropped without running their cleanup.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.queue.close();

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!(scheduler = self.shared.id, "worker thread panicked");
            }
        }
        drop(workers);

        let dropped = self.shared.queue.drain();
        if dropped > 0 {
            tracing::warn!(scheduler = self.shared.id, dropped, "queued jobs abandoned at shutdown");
        }
        tracing::info!(scheduler = self.shared.id, "scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.shared.id)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A job about to be launched.
#[must_use = "a job builder does nothing until submitted"]
pub struct JobBuilder<'s, F> {
    shared: &'s Arc<Shared>,
    fibre: F,
    deadline: u32,
    class: JobClass,
}

impl<'s, F: Fibre> JobBuilder<'s, F> {
    pub(crate) fn new(shared: &'s Arc<Shared>, fibre: F) -> Self {
        Self {
            shared,
            fibre,
            deadline: 0,
            class: JobClass::default(),
        }
    }

    /// Lower deadlines run first.
    pub fn deadline(mut self, deadline: u32) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn class(mut self, class: JobClass) -> Self {
        self.class = class;
        self
    }

    pub fn submit(self) -> Handle {
        self.launch(None)
    }

    /// Allocate, count and queue the job. `waiter`, if any, is parked on
    /// the new job's completion before it can run.
    pub(crate) fn launch(self, waiter: Option<Handle>) -> Handle {
        let Self {
            shared,
            fibre,
            deadline,
            class,
        } = self;
        let job = shared
            .pool
            .alloc(Box::new(FibreCell::new(fibre)), deadline, class);
        if let Some(waiter) = waiter {
            job.waiters.lock().sleep_on(waiter);
        }
        let handle = job.handle();
        shared.histogram.update(deadline, 1);
        tracing::trace!(job = %handle.id(), deadline, ?class, "submitted");
        shared.queue.insert(job);
        handle
    }
}

/// Where a job goes after one step.
enum Next {
    /// Again within this pass.
    ThisPass,
    /// On the next pass.
    NextPass,
    /// Owned by a wait queue now.
    Parked,
    /// Recycled.
    Finished,
}

fn worker_loop(index: usize, shared: &Arc<Shared>) {
    let span = tracing::debug_span!("worker", scheduler = shared.id, id = index);
    let _span = span.enter();
    let _worker = enter_worker(shared.id, index);
    let idle_timeout = shared.config.idle_timeout;

    let mut running = RunList::new();
    let mut expired = RunList::new();
    tracing::debug!("worker started");

    while !shared.shutdown.load(Ordering::Acquire) {
        let timeout = running.is_empty().then_some(idle_timeout);
        if let Some(job) = shared.queue.dequeue(index, timeout) {
            running.insert(job);
        }

        while let Some(job) = running.pop_front() {
            match run_step(&job, shared) {
                Next::ThisPass => running.insert(job),
                Next::NextPass => expired.insert(job),
                Next::Parked | Next::Finished => {}
            }
        }
        std::mem::swap(&mut running, &mut expired);
    }

    let abandoned = running.len() + expired.len();
    if abandoned > 0 {
        tracing::warn!(abandoned, "worker exiting with unfinished jobs");
    }
    tracing::debug!("worker stopped");
}

fn run_step(job: &JobRef, shared: &Arc<Shared>) -> Next {
    let mut body = job.body.lock();
    let epoch = job.begin_step();
    let JobBody { fibre, region } = &mut *body;
    let Some(fibre) = fibre.as_mut() else {
        fatal(format_args!("{} scheduled without a body", job.id()));
    };
    if job.cancel.take_pending() {
        tracing::debug!(job = %job.id(), "cancelled; running cleanup");
        fibre.divert_to_cleanup();
    }

    let status = fibre.step(StepEnv { job, shared, region });
    tracing::trace!(job = %job.id(), epoch, ?status, at = %fibre.point(), "step");

    match status {
        JobStatus::Running => {
            if job.status() != JobStatus::Running {
                fatal(format_args!("{} yielded while parked", job.id()));
            }
            Next::ThisPass
        }
        JobStatus::Waiting | JobStatus::Yielded => {
            if let Err(actual) = job.transition(&[JobStatus::Running], status) {
                fatal(format_args!("{} returned {:?} while {:?}", job.id(), status, actual));
            }
            Next::NextPass
        }
        JobStatus::Blocked => {
            // Parked jobs are owned by their wait queue. One that never
            // parked would be lost, so it is retried next pass instead.
            if job.transition(&[JobStatus::Running], JobStatus::Waiting).is_ok() {
                tracing::warn!(job = %job.id(), "returned Blocked without parking");
                return Next::NextPass;
            }
            // Cancelled mid-step, after `cancel` found the job Running.
            fence(Ordering::SeqCst);
            if job.cancel.is_pending()
                && job.transition(&[JobStatus::Blocked], JobStatus::Waiting).is_ok()
            {
                return Next::NextPass;
            }
            Next::Parked
        }
        JobStatus::Done | JobStatus::Exited => {
            finish(job, shared, &mut body);
            Next::Finished
        }
        JobStatus::New | JobStatus::Cancelled => {
            fatal(format_args!("{} returned unexpected status {:?}", job.id(), status));
        }
    }
}

/// Release waiters, recycle the record, then retire the deadline. The
/// histogram goes last so a returning join implies the jobs are back in
/// the pool.
fn finish(job: &JobRef, shared: &Shared, body: &mut JobBody) {
    let id = job.id();
    let deadline = job.deadline();
    {
        let mut waiters = job.waiters.lock();
        if let Err(status) = job.transition(&[JobStatus::Running], JobStatus::Done) {
            fatal(format_args!("{} exited while {:?}", id, status));
        }
        let woken = waiters.wake_all();
        tracing::trace!(job = %id, deadline, woken, "finished");
    }
    shared.pool.free(job, body);
    shared.histogram.update(deadline, -1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fibre::{from_fn, JobContext};
    use std::sync::atomic::AtomicU32;

    fn scheduler(workers: usize) -> Scheduler {
        Scheduler::new(
            SchedulerConfig::default()
                .workers(workers)
                .idle_timeout(Duration::from_millis(20)),
        )
        .unwrap()
    }

    #[test]
    fn runs_submitted_jobs() {
        let sched = scheduler(2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            sched.submit(
                from_fn(move |_| {
                    c.fetch_add(1, Ordering::Relaxed);
                }),
                1,
            );
        }
        assert_eq!(sched.join_deadline(1), Ok(()));
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        let stats = sched.stats();
        assert_eq!(stats.jobs_free, stats.jobs_allocated);
        assert_eq!(stats.outstanding_deadlines, 0);
    }

    #[test]
    fn default_worker_count_starts() {
        let sched = Scheduler::with_workers(0).unwrap();
        assert!(sched.workers() >= 1);
        sched.shutdown();
    }

    #[test]
    fn zero_idle_timeout_is_rejected() {
        let err = Scheduler::new(SchedulerConfig::default().idle_timeout(Duration::ZERO)).unwrap_err();
        assert!(matches!(err, InitError::Config(_)));
    }

    #[test]
    fn worker_threads_are_named() {
        let sched = Scheduler::new(
            SchedulerConfig::default()
                .workers(1)
                .thread_name_prefix("test-pool"),
        )
        .unwrap();
        let name = Arc::new(Mutex::new(None));
        let n = name.clone();
        sched.submit(
            from_fn(move |_| {
                *n.lock() = thread::current().name().map(str::to_string);
            }),
            0,
        );
        sched.join_deadline(0).unwrap();
        assert_eq!(name.lock().as_deref(), Some("test-pool-0"));
    }

    struct Counter {
        left: u32,
        steps: Arc<AtomicU32>,
    }

    impl Fibre for Counter {
        type Point = u32;

        fn resume(&mut self, at: u32, cx: &mut JobContext<'_, u32>) -> JobStatus {
            if at == u32::MAX {
                return cx.exit();
            }
            self.steps.fetch_add(1, Ordering::Relaxed);
            if self.left == 0 {
                return cx.exit();
            }
            self.left -= 1;
            if self.left % 2 == 0 {
                cx.yield_now(1)
            } else {
                cx.wait(2)
            }
        }
    }

    #[test]
    fn yielding_job_resumes_until_exit() {
        let sched = scheduler(1);
        let steps = Arc::new(AtomicU32::new(0));
        sched.submit(
            Counter {
                left: 5,
                steps: steps.clone(),
            },
            3,
        );
        sched.join_deadline(3).unwrap();
        assert_eq!(steps.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn stale_handle_reports_no_status() {
        let sched = scheduler(1);
        let h = sched.submit(from_fn(|_| {}), 0);
        sched.join_deadline(0).unwrap();
        assert_eq!(sched.status(&h), None);
        assert!(!sched.cancel(&h));
    }

    #[test]
    fn stale_cancel_leaves_recycled_cell_alone() {
        let sched = scheduler(1);
        let old = sched.submit(from_fn(|_| {}), 0);
        sched.join_deadline(0).unwrap();

        let ran = Arc::new(AtomicU32::new(0));
        let r = ran.clone();
        // Blocks the worker until the stale cancel has been attempted.
        let gate = Arc::new(AtomicBool::new(false));
        let g = gate.clone();
        let new = sched.submit(
            from_fn(move |_| {
                while !g.load(Ordering::Acquire) {
                    thread::yield_now();
                }
                r.fetch_add(1, Ordering::SeqCst);
            }),
            1,
        );
        assert_eq!(sched.stats().jobs_allocated, 1);
        assert!(!sched.cancel(&old));
        assert_ne!(sched.status(&new), Some(JobStatus::Cancelled));
        gate.store(true, Ordering::Release);

        sched.join_deadline(1).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn racing_stale_cancels_never_hit_new_jobs() {
        let sched = scheduler(2);
        let ran = Arc::new(AtomicU32::new(0));
        let rounds = 300;
        let mut stale = sched.submit(from_fn(|_| {}), 0);
        sched.join_deadline(0).unwrap();
        for round in 1..=rounds {
            let r = ran.clone();
            thread::scope(|scope| {
                let target = stale.clone();
                let sched = &sched;
                scope.spawn(move || {
                    for _ in 0..64 {
                        sched.cancel(&target);
                    }
                });
                stale = sched.submit(
                    from_fn(move |_| {
                        r.fetch_add(1, Ordering::SeqCst);
                    }),
                    round,
                );
                sched.join_deadline(round).unwrap();
            });
        }
        assert_eq!(ran.load(Ordering::SeqCst), rounds);
    }

    #[derive(Debug, Clone, Copy)]
    enum Move {
        Wait,
        Yield,
        Exit,
    }

    /// Logs its deadline on every step and follows `moves`.
    struct Scripted {
        moves: Vec<Move>,
        step: usize,
        log: Arc<Mutex<Vec<u32>>>,
    }

    impl Fibre for Scripted {
        type Point = u32;

        fn resume(&mut self, at: u32, cx: &mut JobContext<'_, u32>) -> JobStatus {
            if at == u32::MAX {
                return cx.exit();
            }
            self.log.lock().push(cx.deadline());
            let next = self.moves.get(self.step).copied().unwrap_or(Move::Exit);
            self.step += 1;
            match next {
                Move::Wait => cx.wait(1),
                Move::Yield => cx.yield_now(1),
                Move::Exit => cx.exit(),
            }
        }
    }

    /// Runs both scripts on one worker, queued together from a gate job,
    /// and returns the order their steps ran in.
    fn run_pair(first: (u32, Vec<Move>), second: (u32, Vec<Move>)) -> Vec<u32> {
        let sched = scheduler(1);
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        sched.submit(
            from_fn(move |cx| {
                for (deadline, moves) in [first, second] {
                    cx.job(Scripted {
                        moves,
                        step: 0,
                        log: l.clone(),
                    })
                    .deadline(deadline)
                    .submit();
                }
            }),
            0,
        );
        assert!(sched.wait_idle(Duration::from_secs(10)));
        let order = log.lock().clone();
        order
    }

    #[test]
    fn waiting_job_lets_later_deadline_run_between_steps() {
        let order = run_pair(
            (1, vec![Move::Wait, Move::Wait, Move::Wait, Move::Exit]),
            (9, vec![Move::Exit]),
        );
        assert_eq!(order, vec![1, 1, 9, 1, 1]);
    }

    #[test]
    fn yield_reruns_ahead_of_later_deadlines_in_same_pass() {
        let order = run_pair(
            (1, vec![Move::Wait, Move::Yield, Move::Yield, Move::Yield, Move::Exit]),
            (5, vec![Move::Exit]),
        );
        assert_eq!(order, vec![1, 1, 1, 1, 1, 5]);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let sched = scheduler(2);
        sched.shutdown();
        sched.shutdown();
        assert_eq!(sched.workers.lock().len(), 0);
    }
}
