// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Multi-channel select.
//!
//! A chanmux attempts a set of reads and writes across channels as one
//! atomic step: every distinct channel is locked (in ascending channel id
//! order, so concurrent muxes over overlapping channels cannot deadlock),
//! each operand is attempted in the order it was added, and only if none
//! succeeded is the job parked on every operand's wait queue. The locks are
//! held across the park, so a transfer that lands between the attempt and
//! the park still finds the job on the queue.
//!
//! A woken job re-runs the whole mux. Operands that succeeded are left
//! marked [`OperandStatus::Ready`] for the caller to walk with
//! [`Chanmux::first`] / [`Chanmux::next`].

use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::channel::{Channel, ChannelState, Side, Transfer};
use crate::error::ChannelError;
use crate::fibre::{JobContext, ResumePoint};
use crate::job::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxOp {
    Read,
    Write,
}

impl MuxOp {
    fn side(self) -> Side {
        match self {
            MuxOp::Read => Side::Read,
            MuxOp::Write => Side::Write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandStatus {
    /// Not attempted since the last reset.
    Idle,
    /// Transfer completed on the last attempt.
    Ready,
    /// Last attempt fell short by `needed` bytes.
    Blocked { needed: usize },
}

/// Result of one mux attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxOutcome {
    /// This many operands completed.
    Ready(usize),
    /// None completed. From a job, it is parked on every operand.
    Blocked,
}

#[derive(Debug)]
struct Operand {
    op: MuxOp,
    channel: Arc<Channel>,
    buf: Vec<u8>,
    status: OperandStatus,
}

#[derive(Debug, Default)]
pub struct Chanmux {
    operands: Vec<Operand>,
}

impl Chanmux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a read of `size` bytes from `channel`.
    pub fn read(mut self, channel: &Arc<Channel>, size: usize) -> Self {
        self.push(MuxOp::Read, channel, vec![0; size]);
        self
    }

    /// Add a write of `data` to `channel`.
    pub fn write(mut self, channel: &Arc<Channel>, data: impl Into<Vec<u8>>) -> Self {
        self.push(MuxOp::Write, channel, data.into());
        self
    }

    /// Append an operand; returns its index.
    pub fn push(&mut self, op: MuxOp, channel: &Arc<Channel>, buf: Vec<u8>) -> usize {
        self.operands.push(Operand {
            op,
            channel: Arc::clone(channel),
            buf,
            status: OperandStatus::Idle,
        });
        self.operands.len() - 1
    }

    /// Replace the payload of write operand `index` (or resize a read's
    /// buffer) for the next attempt.
    pub fn set_data(&mut self, index: usize, data: impl Into<Vec<u8>>) -> Result<(), ChannelError> {
        let len = self.operands.len();
        let operand = self
            .operands
            .get_mut(index)
            .ok_or(ChannelError::NoSuchOperand { index, len })?;
        operand.buf = data.into();
        operand.status = OperandStatus::Idle;
        Ok(())
    }

    /// Attempt every operand from a job, parking on all of them if none
    /// completes. On `Blocked` the caller returns [`JobContext::block`].
    pub fn mux<P: ResumePoint>(&mut self, cx: &mut JobContext<'_, P>) -> Result<MuxOutcome, ChannelError> {
        self.attempt(Some(|| cx.park()))
    }

    /// Attempt every operand once without parking.
    pub fn try_mux(&mut self) -> Result<MuxOutcome, ChannelError> {
        self.attempt(None::<fn() -> Handle>)
    }

    fn attempt<F>(&mut self, park: Option<F>) -> Result<MuxOutcome, ChannelError>
    where
        F: FnOnce() -> Handle,
    {
        for operand in &self.operands {
            operand.channel.check_size(operand.buf.len())?;
        }

        let mut channels: Vec<Arc<Channel>> =
            self.operands.iter().map(|o| Arc::clone(&o.channel)).collect();
        channels.sort_by_key(|c| c.id());
        channels.dedup_by_key(|c| c.id());

        let mut guards: Vec<MutexGuard<'_, ChannelState>> =
            channels.iter().map(|c| c.lock()).collect();
        let slot = |id: u64| {
            channels
                .binary_search_by_key(&id, |c| c.id())
                .unwrap_or_else(|at| at)
        };

        let mut ready = 0;
        for operand in &mut self.operands {
            let state = &mut guards[slot(operand.channel.id())];
            let result = match operand.op {
                MuxOp::Read => state.attempt_read(&mut operand.buf),
                MuxOp::Write => state.attempt_write(&operand.buf),
            };
            operand.status = match result {
                Transfer::Done(_) => {
                    ready += 1;
                    OperandStatus::Ready
                }
                Transfer::Blocked { needed } => OperandStatus::Blocked { needed },
            };
        }

        if ready == 0 {
            if let Some(park) = park {
                let handle = park();
                for operand in &self.operands {
                    let queue = guards[slot(operand.channel.id())].queue(operand.op.side());
                    if !queue.contains(&handle) {
                        queue.sleep_on(handle.clone());
                    }
                }
            }
        }

        // Release in reverse order of acquisition.
        while let Some(guard) = guards.pop() {
            drop(guard);
        }

        Ok(if ready == 0 {
            MuxOutcome::Blocked
        } else {
            MuxOutcome::Ready(ready)
        })
    }

    /// Index of the first ready operand.
    pub fn first(&self) -> Option<usize> {
        self.ready_from(0)
    }

    /// Index of the next ready operand after `index`.
    pub fn next(&self, index: usize) -> Option<usize> {
        self.ready_from(index + 1)
    }

    fn ready_from(&self, start: usize) -> Option<usize> {
        self.operands
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, o)| o.status == OperandStatus::Ready)
            .map(|(i, _)| i)
    }

    /// Ready operand indices in order.
    pub fn ready(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.first(), move |&i| self.next(i))
    }

    /// Operand buffer: data read, or data to be written.
    pub fn data(&self, index: usize) -> Option<&[u8]> {
        self.operands.get(index).map(|o| o.buf.as_slice())
    }

    pub fn size(&self, index: usize) -> Option<usize> {
        self.operands.get(index).map(|o| o.buf.len())
    }

    pub fn status(&self, index: usize) -> Option<OperandStatus> {
        self.operands.get(index).map(|o| o.status)
    }

    pub fn op(&self, index: usize) -> Option<MuxOp> {
        self.operands.get(index).map(|o| o.op)
    }

    /// Mark every operand idle again.
    pub fn reset(&mut self) {
        for operand in &mut self.operands {
            operand.status = OperandStatus::Idle;
        }
    }

    pub fn len(&self) -> usize {
        self.operands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::fibre::Fibre;
    use crate::job::JobStatus;
    use crate::scheduler::Scheduler;
    use std::time::{Duration, Instant};

    #[test]
    fn one_ready_operand() {
        let a = Channel::shared(4, 1).unwrap();
        let b = Channel::shared(4, 1).unwrap();
        a.try_write(&[1, 2, 3, 4]).unwrap();

        let mut mux = Chanmux::new().read(&a, 4).read(&b, 4);
        assert_eq!(mux.try_mux().unwrap(), MuxOutcome::Ready(1));
        assert_eq!(mux.first(), Some(0));
        assert_eq!(mux.next(0), None);
        assert_eq!(mux.data(0), Some(&[1, 2, 3, 4][..]));
        assert_eq!(mux.status(1), Some(OperandStatus::Blocked { needed: 4 }));
    }

    #[test]
    fn ready_operands_found_in_order() {
        let a = Channel::shared(1, 4).unwrap();
        let b = Channel::shared(1, 4).unwrap();
        let c = Channel::shared(1, 4).unwrap();
        c.try_write(&[7]).unwrap();

        let mut mux = Chanmux::new().read(&a, 1).write(&b, vec![5, 6]).read(&c, 1);
        assert_eq!(mux.try_mux().unwrap(), MuxOutcome::Ready(2));
        assert_eq!(mux.ready().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(mux.first(), Some(1));
        assert_eq!(mux.next(1), Some(2));
        assert_eq!(mux.next(2), None);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn nothing_ready_is_blocked() {
        let a = Channel::shared(2, 1).unwrap();
        let mut mux = Chanmux::new().read(&a, 2);
        assert_eq!(mux.try_mux().unwrap(), MuxOutcome::Blocked);
        assert_eq!(mux.first(), None);
        assert_eq!(a.parked(), (0, 0));
    }

    #[test]
    fn same_channel_twice_locks_once() {
        let a = Channel::shared(1, 4).unwrap();
        a.try_write(&[1, 2]).unwrap();
        let mut mux = Chanmux::new().read(&a, 1).read(&a, 1);
        assert_eq!(mux.try_mux().unwrap(), MuxOutcome::Ready(2));
        assert_eq!(mux.data(0), Some(&[1][..]));
        assert_eq!(mux.data(1), Some(&[2][..]));
    }

    #[test]
    fn oversized_operand_rejected_before_any_transfer() {
        let a = Channel::shared(1, 2).unwrap();
        let b = Channel::shared(1, 2).unwrap();
        a.try_write(&[1]).unwrap();
        let mut mux = Chanmux::new().read(&a, 1).write(&b, vec![0; 3]);
        assert!(matches!(mux.try_mux(), Err(ChannelError::Oversized { .. })));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn set_data_and_reset() {
        let a = Channel::shared(1, 4).unwrap();
        let mut mux = Chanmux::new().write(&a, vec![1]);
        assert_eq!(mux.try_mux().unwrap(), MuxOutcome::Ready(1));
        mux.set_data(0, vec![2, 3]).unwrap();
        assert_eq!(mux.status(0), Some(OperandStatus::Idle));
        assert_eq!(mux.size(0), Some(2));
        assert_eq!(
            mux.set_data(4, vec![]),
            Err(ChannelError::NoSuchOperand { index: 4, len: 1 })
        );
        mux.try_mux().unwrap();
        mux.reset();
        assert_eq!(mux.first(), None);
        assert_eq!(a.len(), 3);
    }

    /// Muxes until `left` operands have completed.
    struct Select {
        mux: Chanmux,
        left: usize,
    }

    impl Fibre for Select {
        type Point = u32;

        fn resume(&mut self, at: u32, cx: &mut JobContext<'_, u32>) -> JobStatus {
            if at == u32::MAX {
                return cx.exit();
            }
            loop {
                match self.mux.mux(cx) {
                    Ok(MuxOutcome::Ready(n)) => {
                        self.left = self.left.saturating_sub(n);
                        if self.left == 0 {
                            return cx.exit();
                        }
                    }
                    Ok(MuxOutcome::Blocked) => return cx.block(1),
                    Err(_) => return cx.exit(),
                }
            }
        }
    }

    #[test]
    fn idle_operand_queue_stays_bounded() {
        let sched = Scheduler::new(
            SchedulerConfig::default()
                .workers(1)
                .idle_timeout(Duration::from_millis(20)),
        )
        .unwrap();
        let data = Channel::shared(1, 1).unwrap();
        let control = Channel::shared(1, 1).unwrap();
        let items = 500;
        sched.submit(
            Select {
                mux: Chanmux::new().read(&data, 1).read(&control, 1),
                left: items,
            },
            1,
        );

        let start = Instant::now();
        for i in 0..items {
            while !data.try_write(&[i as u8]).unwrap().is_done() {
                assert!(start.elapsed() < Duration::from_secs(10), "reader stalled");
                std::thread::yield_now();
            }
            assert!(control.lock().queue(Side::Read).len() <= 1);
        }
        sched.join_deadline(1).unwrap();

        assert!(control.lock().queue(Side::Read).len() <= 1);
        assert_eq!(control.parked(), (0, 0));
        assert_eq!(data.parked(), (0, 0));
    }
}
