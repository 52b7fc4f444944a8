// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation flag.
//!
//! Set from any thread; observed by the worker at the start of the job's
//! next step, which forces the fibre onto its cleanup path. A running job
//! only sees it at its next suspension point.

use std::sync::atomic::{AtomicBool, Ordering};

/// Cancellation state of one job incarnation.
#[derive(Debug, Default)]
pub struct CancelToken {
    requested: AtomicBool,
    /// Worker already diverted the fibre to cleanup for this request.
    observed: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns false if it was already requested.
    pub fn cancel(&self) -> bool {
        !self.requested.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// True exactly once per request: the first step that observes it.
    pub(crate) fn take_pending(&self) -> bool {
        self.is_cancelled() && !self.observed.swap(true, Ordering::AcqRel)
    }

    /// Requested but not yet observed by a step.
    pub(crate) fn is_pending(&self) -> bool {
        self.is_cancelled() && !self.observed.load(Ordering::Acquire)
    }

    /// Clear for the next incarnation of a recycled job.
    pub(crate) fn reset(&self) {
        self.requested.store(false, Ordering::Release);
        self.observed.store(false, Ordering::Release);
    }
}
