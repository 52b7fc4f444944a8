// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded byte channels.
//!
//! A fixed-capacity ring buffer with a reader and a writer wait queue, all
//! under one lock. Transfers are all-or-nothing: a read or write of `n`
//! bytes either moves all `n` or reports how many more bytes (of data or
//! of space) it needs.
//!
//! Every attempt wakes one parked job on the opposite side. A failed write
//! needs a reader to drain the buffer; a successful one may satisfy a
//! parked reader (and a write that fills the buffer must). Reads mirror
//! this for writers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::ChannelError;
use crate::fibre::{JobContext, ResumePoint};
use crate::waitqueue::WaitQueue;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of a channel transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// All bytes moved.
    Done(usize),
    /// Nothing moved; `needed` more bytes of data (read) or space (write)
    /// are required.
    Blocked { needed: usize },
}

impl Transfer {
    pub fn is_done(&self) -> bool {
        matches!(self, Transfer::Done(_))
    }

    /// Signed form: bytes moved, or the negated shortfall.
    pub fn code(&self) -> isize {
        match *self {
            Transfer::Done(n) => n as isize,
            Transfer::Blocked { needed } => -(needed as isize),
        }
    }
}

/// Snapshot of how much could be transferred right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPoll {
    pub readable: usize,
    pub writable: usize,
}

/// Which wait queue a blocked operation parks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Read,
    Write,
}

pub(crate) struct ChannelState {
    buf: Box<[u8]>,
    /// Monotonic byte counters; positions are taken modulo capacity.
    written: u64,
    read: u64,
    readers: WaitQueue,
    writers: WaitQueue,
}

impl ChannelState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn used(&self) -> usize {
        (self.written - self.read) as usize
    }

    fn space(&self) -> usize {
        self.capacity() - self.used()
    }

    fn put(&mut self, data: &[u8]) -> Transfer {
        let space = self.space();
        if data.len() > space {
            return Transfer::Blocked {
                needed: data.len() - space,
            };
        }
        let cap = self.capacity();
        let start = (self.written % cap as u64) as usize;
        let first = data.len().min(cap - start);
        self.buf[start..start + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        self.written += data.len() as u64;
        Transfer::Done(data.len())
    }

    fn take(&mut self, out: &mut [u8]) -> Transfer {
        let used = self.used();
        if out.len() > used {
            return Transfer::Blocked {
                needed: out.len() - used,
            };
        }
        let cap = self.capacity();
        let start = (self.read % cap as u64) as usize;
        let first = out.len().min(cap - start);
        let rest = out.len() - first;
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        out[first..].copy_from_slice(&self.buf[..rest]);
        self.read += out.len() as u64;
        Transfer::Done(out.len())
    }

    pub(crate) fn attempt_write(&mut self, data: &[u8]) -> Transfer {
        let result = self.put(data);
        self.readers.wakeup();
        result
    }

    pub(crate) fn attempt_read(&mut self, out: &mut [u8]) -> Transfer {
        let result = self.take(out);
        self.writers.wakeup();
        result
    }

    pub(crate) fn queue(&mut self, side: Side) -> &mut WaitQueue {
        match side {
            Side::Read => &mut self.readers,
            Side::Write => &mut self.writers,
        }
    }
}

/// A bounded byte channel shared between jobs (and native threads, through
/// the non-blocking calls).
///
/// Dropping a channel that still has parked jobs strands them; the owner
/// must make sure none are left.
pub struct Channel {
    id: u64,
    item_size: usize,
    capacity: usize,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// A channel holding `count` items of `item_size` bytes.
    pub fn new(item_size: usize, count: usize) -> Result<Self, ChannelError> {
        let capacity = item_size
            .checked_mul(count)
            .ok_or(ChannelError::CapacityOverflow { item_size, count })?;
        if capacity == 0 {
            return Err(ChannelError::ZeroCapacity { item_size, count });
        }
        Ok(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            item_size,
            capacity,
            state: Mutex::new(ChannelState {
                buf: vec![0; capacity].into_boxed_slice(),
                written: 0,
                read: 0,
                readers: WaitQueue::new(),
                writers: WaitQueue::new(),
            }),
        })
    }

    /// [`new`](Self::new), wrapped for sharing.
    pub fn shared(item_size: usize, count: usize) -> Result<Arc<Self>, ChannelError> {
        Self::new(item_size, count).map(Arc::new)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes buffered.
    pub fn len(&self) -> usize {
        self.state.lock().used()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock()
    }

    pub(crate) fn check_size(&self, size: usize) -> Result<(), ChannelError> {
        if size > self.capacity {
            return Err(ChannelError::Oversized {
                size,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Write all of `data` or nothing, without parking.
    pub fn try_write(&self, data: &[u8]) -> Result<Transfer, ChannelError> {
        self.check_size(data.len())?;
        Ok(self.lock().attempt_write(data))
    }

    /// Fill all of `out` or nothing, without parking.
    pub fn try_read(&self, out: &mut [u8]) -> Result<Transfer, ChannelError> {
        self.check_size(out.len())?;
        Ok(self.lock().attempt_read(out))
    }

    /// Write from a job. On `Blocked` the job is already parked on the
    /// writer queue and must return [`JobContext::block`].
    pub fn write<P: ResumePoint>(
        &self,
        cx: &mut JobContext<'_, P>,
        data: &[u8],
    ) -> Result<Transfer, ChannelError> {
        self.check_size(data.len())?;
        let mut state = self.lock();
        let result = state.attempt_write(data);
        if !result.is_done() {
            state.writers.sleep_on(cx.park());
        }
        Ok(result)
    }

    /// Read from a job. On `Blocked` the job is already parked on the
    /// reader queue and must return [`JobContext::block`].
    pub fn read<P: ResumePoint>(
        &self,
        cx: &mut JobContext<'_, P>,
        out: &mut [u8],
    ) -> Result<Transfer, ChannelError> {
        self.check_size(out.len())?;
        let mut state = self.lock();
        let result = state.attempt_read(out);
        if !result.is_done() {
            state.readers.sleep_on(cx.park());
        }
        Ok(result)
    }

    /// Wake every parked reader and writer so they retry.
    pub fn flush(&self) -> usize {
        let mut state = self.lock();
        state.readers.wake_all() + state.writers.wake_all()
    }

    pub fn poll(&self) -> ChannelPoll {
        let state = self.lock();
        ChannelPoll {
            readable: state.used(),
            writable: state.space(),
        }
    }

    /// Jobs parked here that a transfer could still wake, as
    /// (readers, writers).
    pub fn parked(&self) -> (usize, usize) {
        let state = self.lock();
        (state.readers.live(), state.writers.live())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("capacity", &state.capacity())
            .field("used", &state.used())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let (readers, writers) = (state.readers.live(), state.writers.live());
        if readers + writers > 0 {
            tracing::warn!(
                channel = self.id,
                readers,
                writers,
                "channel dropped with parked jobs"
            );
        }
    }
}
