// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Per-job scratch arena.
//!
//! Bump allocation over a byte buffer owned by the job cell. Reclaimed
//! when the cell is recycled; the buffer's capacity survives, so a pooled
//! job that needed scratch once does not reallocate next time.

const ALIGN: usize = 8;

/// Location of an allocation inside a [`Region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionSpan {
    offset: usize,
    len: usize,
}

impl RegionSpan {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Default)]
pub struct Region {
    buf: Vec<u8>,
    used: usize,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `len` zeroed bytes.
    pub fn alloc(&mut self, len: usize) -> RegionSpan {
        let offset = self.used.next_multiple_of(ALIGN);
        let end = offset + len;
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].fill(0);
        self.used = end;
        RegionSpan { offset, len }
    }

    pub fn get(&self, span: RegionSpan) -> &[u8] {
        &self.buf[span.offset..span.offset + span.len]
    }

    pub fn get_mut(&mut self, span: RegionSpan) -> &mut [u8] {
        &mut self.buf[span.offset..span.offset + span.len]
    }

    /// Bytes handed out since the last reclaim.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes retained across reclaims.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Forget every allocation; spans from before are no longer meaningful.
    pub fn reclaim(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_disjoint_and_aligned() {
        let mut r = Region::new();
        let a = r.alloc(3);
        let b = r.alloc(5);
        r.get_mut(a).copy_from_slice(&[1, 2, 3]);
        r.get_mut(b).fill(9);
        assert_eq!(r.get(a), &[1, 2, 3]);
        assert_eq!(r.get(b), &[9; 5]);
        assert_eq!(b.offset % ALIGN, 0);
    }

    #[test]
    fn reclaim_keeps_capacity_and_rezeroes() {
        let mut r = Region::new();
        let a = r.alloc(16);
        r.get_mut(a).fill(7);
        let cap = r.capacity();
        r.reclaim();
        assert_eq!(r.used(), 0);
        assert_eq!(r.capacity(), cap);
        let b = r.alloc(16);
        assert_eq!(r.get(b), &[0; 16]);
        assert_eq!(r.capacity(), cap);
    }
}
