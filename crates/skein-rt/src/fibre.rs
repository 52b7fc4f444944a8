// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stackless coroutines.
//!
//! A job body is a value implementing [`Fibre`]. Each call to
//! [`Fibre::resume`] runs from the recorded resume point to the next
//! suspension point and returns the job's new status. Nothing on the call
//! stack survives a suspension: state that must persist lives in the
//! fibre's own fields, which are heap-allocated with the job and dropped
//! when it exits.
//!
//! ```ignore
//! #[derive(Debug, Clone, Copy, PartialEq, Default)]
//! enum At { #[default] Start, Send, Cleanup }
//!
//! impl ResumePoint for At {
//!     fn cleanup() -> Self { At::Cleanup }
//! }
//!
//! impl Fibre for Producer {
//!     type Point = At;
//!     fn resume(&mut self, at: At, cx: &mut JobContext<'_, At>) -> JobStatus {
//!         match at {
//!             At::Start => { self.fill(); cx.yield_now(At::Send) }
//!             At::Send => match self.tx.write(cx, &self.buf) {
//!                 Ok(Transfer::Done(_)) => cx.exit(),
//!                 Ok(Transfer::Blocked { .. }) => cx.block(At::Send),
//!                 Err(_) => cx.exit(),
//!             },
//!             At::Cleanup => cx.exit(),
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use crate::job::region::{Region, RegionSpan};
use crate::job::{Handle, JobClass, JobRef, JobStatus};
use crate::scheduler::{JobBuilder, Shared};
use crate::waitqueue::WaitQueue;

/// A fibre's resume marker.
///
/// `Default` is the entry point. [`cleanup`](ResumePoint::cleanup) is where
/// the worker sends a cancelled job so that only its teardown runs.
pub trait ResumePoint: Copy + Default + PartialEq + fmt::Debug + Send + 'static {
    fn cleanup() -> Self;
}

/// Line-counter style markers: 0 is the entry, `u32::MAX` the cleanup path.
impl ResumePoint for u32 {
    fn cleanup() -> Self {
        u32::MAX
    }
}

/// A job body.
pub trait Fibre: Send + 'static {
    type Point: ResumePoint;

    /// Run from `at` to the next suspension point.
    ///
    /// Must return through one of the [`JobContext`] terminal forms so the
    /// marker matches the returned status.
    fn resume(&mut self, at: Self::Point, cx: &mut JobContext<'_, Self::Point>) -> JobStatus;
}

/// What the worker needs from a type-erased fibre.
pub(crate) trait ErasedFibre: Send {
    fn step(&mut self, env: StepEnv<'_>) -> JobStatus;

    /// Force the marker onto the cleanup path.
    fn divert_to_cleanup(&mut self);

    fn point(&self) -> String;
}

/// Everything a step may touch besides the fibre itself.
pub(crate) struct StepEnv<'a> {
    pub job: &'a JobRef,
    pub shared: &'a Arc<Shared>,
    pub region: &'a mut Region,
}

pub(crate) struct FibreCell<F: Fibre> {
    body: F,
    point: F::Point,
}

impl<F: Fibre> FibreCell<F> {
    pub fn new(body: F) -> Self {
        Self {
            body,
            point: F::Point::default(),
        }
    }
}

impl<F: Fibre> ErasedFibre for FibreCell<F> {
    fn step(&mut self, env: StepEnv<'_>) -> JobStatus {
        let Self { body, point } = self;
        let at = *point;
        let mut cx = JobContext {
            job: env.job,
            shared: env.shared,
            region: env.region,
            point,
        };
        body.resume(at, &mut cx)
    }

    fn divert_to_cleanup(&mut self) {
        self.point = F::Point::cleanup();
    }

    fn point(&self) -> String {
        format!("{:?}", self.point)
    }
}

/// The running job's view of itself and its scheduler.
pub struct JobContext<'a, P> {
    job: &'a JobRef,
    shared: &'a Arc<Shared>,
    region: &'a mut Region,
    point: &'a mut P,
}

impl<'a, P: ResumePoint> JobContext<'a, P> {
    // === Terminal forms ===

    /// Finish the job. The marker is reset.
    pub fn exit(&mut self) -> JobStatus {
        *self.point = P::default();
        JobStatus::Done
    }

    /// Loop back to the entry point; runs again next pass.
    pub fn restart(&mut self) -> JobStatus {
        *self.point = P::default();
        JobStatus::Yielded
    }

    /// Resume at `at` later in this same pass, after any earlier-deadline
    /// jobs in the pass have had their turn.
    pub fn yield_now(&mut self, at: P) -> JobStatus {
        *self.point = at;
        JobStatus::Running
    }

    /// Resume at `at` on the worker's next pass.
    pub fn wait(&mut self, at: P) -> JobStatus {
        *self.point = at;
        JobStatus::Waiting
    }

    /// Resume at `at` once woken. Only valid after parking on a wait queue
    /// (directly or through a channel, chanmux, call or wait_for).
    pub fn block(&mut self, at: P) -> JobStatus {
        *self.point = at;
        JobStatus::Blocked
    }

    // === Composition ===

    /// Build a job on this scheduler. Inherits this job's deadline.
    pub fn job<F: Fibre>(&self, fibre: F) -> JobBuilder<'a, F> {
        JobBuilder::new(self.shared, fibre).deadline(self.deadline())
    }

    /// Launch an independent job with this job's deadline.
    pub fn spawn<F: Fibre>(&self, fibre: F) -> Handle {
        self.job(fibre).submit()
    }

    /// Launch a child and block until it finishes; resumes at `at`.
    pub fn call<F: Fibre>(&mut self, fibre: F, at: P) -> JobStatus {
        let child = self.job(fibre);
        self.call_with(child, at)
    }

    /// [`call`](Self::call) with an explicitly configured child.
    pub fn call_with<F: Fibre>(&mut self, child: JobBuilder<'_, F>, at: P) -> JobStatus {
        // Parked before the child is queued, so its exit cannot be missed.
        let me = self.job.park();
        child.launch(Some(me));
        self.block(at)
    }

    /// Park until `target` finishes. `None` if it already has (or the
    /// handle is stale) and the caller should carry on.
    pub fn wait_for(&mut self, target: &Handle, at: P) -> Option<JobStatus> {
        if Arc::ptr_eq(target.job(), self.job) {
            return None;
        }
        let mut waiters = target.job().waiters.lock();
        if !target.is_valid() || target.job().status() == JobStatus::Done {
            return None;
        }
        waiters.sleep_on(self.job.park());
        drop(waiters);
        Some(self.block(at))
    }

    /// Park on a caller-managed wait queue. Follow with [`block`](Self::block).
    pub fn sleep_on(&mut self, queue: &mut WaitQueue) {
        queue.sleep_on(self.job.park());
    }

    pub(crate) fn park(&self) -> Handle {
        self.job.park()
    }

    // === Introspection ===

    pub fn is_cancelled(&self) -> bool {
        self.job.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> u32 {
        self.job.deadline()
    }

    pub fn class(&self) -> JobClass {
        self.job.class()
    }

    pub fn handle(&self) -> Handle {
        self.job.handle()
    }

    // === Scratch ===

    /// Zeroed scratch bytes in the job's region, valid until the job exits.
    pub fn scratch(&mut self, len: usize) -> RegionSpan {
        self.region.alloc(len)
    }

    pub fn region(&mut self) -> &mut Region {
        self.region
    }
}

/// Adapter for a body with no suspension points.
pub struct FnFibre<F>(Option<F>);

/// Wrap a closure that runs to completion in a single step.
pub fn from_fn<F>(f: F) -> FnFibre<F>
where
    F: FnOnce(&mut JobContext<'_, u32>) + Send + 'static,
{
    FnFibre(Some(f))
}

impl<F> Fibre for FnFibre<F>
where
    F: FnOnce(&mut JobContext<'_, u32>) + Send + 'static,
{
    type Point = u32;

    fn resume(&mut self, at: u32, cx: &mut JobContext<'_, u32>) -> JobStatus {
        if at != u32::cleanup() {
            if let Some(f) = self.0.take() {
                f(cx);
            }
        }
        cx.exit()
    }
}
