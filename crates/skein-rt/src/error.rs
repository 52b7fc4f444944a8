// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types for scheduler startup, channels and deadline joins.
//!
//! A full or empty channel is not an error: it is reported as
//! [`Transfer::Blocked`](crate::channel::Transfer) and the caller parks.
//! Invariant violations (double insert, freeing a live job, unknown fibre
//! status) are fatal and go through [`fatal`].

use std::panic::Location;

use thiserror::Error;

/// Scheduler construction failures.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to spawn worker thread {index}: {source}")]
    SpawnWorker {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Invalid scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: expected an unsigned integer, got {value:?}")]
    NotANumber { var: &'static str, value: String },

    #[error("idle timeout must be non-zero")]
    ZeroIdleTimeout,
}

/// Channel construction and transfer failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel capacity must be non-zero (item size {item_size}, count {count})")]
    ZeroCapacity { item_size: usize, count: usize },

    #[error("channel capacity overflows: {item_size} x {count}")]
    CapacityOverflow { item_size: usize, count: usize },

    /// A transfer that could never complete, even on an empty/full buffer.
    #[error("transfer of {size} bytes exceeds channel capacity {capacity}")]
    Oversized { size: usize, capacity: usize },

    #[error("chanmux operand {index} out of range ({len} operands)")]
    NoSuchOperand { index: usize, len: usize },
}

/// Deadline join failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// No record exists for the deadline and it is not below the earliest
    /// outstanding one. Callers retry.
    #[error("deadline {deadline} has no outstanding jobs and is not retired (earliest outstanding: {earliest})")]
    Unretired { deadline: u32, earliest: u32 },

    #[error("timed out waiting for deadline {deadline}")]
    TimedOut { deadline: u32 },
}

/// Report an invariant violation and panic.
///
/// Logs the caller location before unwinding so the worker thread's death
/// is attributable in logs even when the panic payload is lost.
#[track_caller]
#[cold]
pub(crate) fn fatal(msg: std::fmt::Arguments<'_>) -> ! {
    let loc = Location::caller();
    tracing::error!(file = loc.file(), line = loc.line(), "{}", msg);
    panic!("{} ({}:{})", msg, loc.file(), loc.line());
}
