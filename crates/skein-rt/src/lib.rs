// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Skein runtime: cooperative, deadline-ordered job scheduling.
//!
//! Jobs are stackless coroutines ([`Fibre`]s) run by a fixed pool of worker
//! threads. Nothing preempts a job: it runs until it returns a status from
//! one of its suspension points, and a job that never returns holds its
//! worker. Lower deadlines run first within each worker pass.
//!
//! Components:
//! - scheduler — worker pool, run passes, submit/cancel/join
//! - fibre — the job body contract and the in-job API
//! - job — job records, handles, pool, run queues, scratch regions
//! - waitqueue — parked-job queues
//! - histogram — outstanding jobs per deadline (frame barrier)
//! - channel — bounded byte ring buffers with blocking read/write
//! - chanmux — select across several channel operations
//! - result — value hand-off from a job to its submitter

pub mod cancel;
pub mod channel;
pub mod chanmux;
pub mod config;
pub mod error;
pub mod fibre;
pub mod histogram;
pub mod job;
pub mod result;
pub mod scheduler;
pub mod waitqueue;

pub use channel::{Channel, ChannelPoll, Transfer};
pub use chanmux::{Chanmux, MuxOp, MuxOutcome, OperandStatus};
pub use config::SchedulerConfig;
pub use error::{ChannelError, ConfigError, InitError, JoinError};
pub use fibre::{from_fn, Fibre, JobContext, ResumePoint};
pub use histogram::DeadlineHistogram;
pub use job::region::{Region, RegionSpan};
pub use job::{Handle, JobClass, JobId, JobStatus};
pub use result::ResultSlot;
pub use scheduler::{JobBuilder, Scheduler, SchedulerStats};
pub use waitqueue::WaitQueue;
