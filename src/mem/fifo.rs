//! Slice-backed FIFO buffers
//!
//! [`SliceFifoBuffer`] is a ring buffer whose storage is one slice
//! allocation, obtained lazily.  [`MultiFifoBuffer`] chains any number of
//! them for unbounded staging.  Connections use these as their I/O
//! staging buffers, so the storage should come and go with traffic, not
//! sit on the heap forever.

use super::slice_pool::{SliceAllocation, SlicePool};
use bytes::Bytes;
use std::collections::VecDeque;

/// Ring buffer over one slice allocation.
///
/// "Null" state (no allocation) is distinct from "empty" (allocated, no
/// data); the `move_from*` variants spell out which side may legally be
/// null.
#[derive(Default)]
pub struct SliceFifoBuffer {
    allocation: Option<SliceAllocation>,
    head: usize,
    tail: usize,
}

impl SliceFifoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.allocation.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn is_full(&self, pool: &SlicePool) -> bool {
        self.tail == pool.slice_size()
    }

    /// Bytes available for reading
    pub fn available(&self) -> usize {
        self.tail - self.head
    }

    pub fn allocate(&mut self, pool: &SlicePool) {
        debug_assert!(self.is_null());
        self.allocation = Some(pool.alloc());
        self.head = 0;
        self.tail = 0;
    }

    pub fn allocate_if_null(&mut self, pool: &SlicePool) {
        if self.is_null() {
            self.allocate(pool);
        }
    }

    pub fn free(&mut self, pool: &SlicePool) {
        if let Some(allocation) = self.allocation.take() {
            pool.free(allocation);
        }
        self.head = 0;
        self.tail = 0;
    }

    pub fn free_if_empty(&mut self, pool: &SlicePool) {
        if self.is_empty() {
            self.free(pool);
        }
    }

    /// Free and reallocate an idle buffer to reduce slice-area
    /// fragmentation
    pub fn cycle_if_empty(&mut self, pool: &SlicePool) {
        if !self.is_null() && self.is_empty() {
            self.free(pool);
            self.allocate(pool);
        }
    }

    /// Append as much of `data` as fits; returns the number of bytes taken
    pub fn push(&mut self, pool: &SlicePool, data: &[u8]) -> usize {
        self.allocate_if_null(pool);
        let allocation = self.allocation.as_ref().unwrap();

        let space = allocation.size() - self.tail;
        let n = data.len().min(space);
        if n == 0 {
            return 0;
        }

        let tail = self.tail;
        pool.with_write(allocation, |buf| {
            buf[tail..tail + n].copy_from_slice(&data[..n]);
        });
        self.tail += n;
        n
    }

    /// Copy of the readable region
    pub fn read(&self, pool: &SlicePool) -> Bytes {
        match &self.allocation {
            None => Bytes::new(),
            Some(allocation) => {
                let (head, tail) = (self.head, self.tail);
                pool.with_read(allocation, |buf| Bytes::copy_from_slice(&buf[head..tail]))
            }
        }
    }

    /// Run `f` over the readable region without copying
    pub fn with_read<R>(&self, pool: &SlicePool, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.allocation {
            None => f(&[]),
            Some(allocation) => {
                let (head, tail) = (self.head, self.tail);
                pool.with_read(allocation, |buf| f(&buf[head..tail]))
            }
        }
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Move data from `src`, swapping the underlying allocations when the
    /// destination is empty so no bytes are copied
    pub fn move_from(&mut self, pool: &SlicePool, src: &mut SliceFifoBuffer) {
        debug_assert!(!self.is_null());
        debug_assert!(!src.is_null());
        self.move_from_inner(pool, src);
    }

    /// Like `move_from`, but the destination may be null
    pub fn move_from_allow_null(&mut self, pool: &SlicePool, src: &mut SliceFifoBuffer) {
        debug_assert!(!src.is_null());
        if self.is_null() && !src.is_empty() {
            std::mem::swap(self, src);
            return;
        }
        self.move_from_inner(pool, src);
    }

    /// Like `move_from`, but the source may be null
    pub fn move_from_allow_src_null(&mut self, pool: &SlicePool, src: &mut SliceFifoBuffer) {
        if src.is_null() {
            return;
        }
        self.move_from_allow_null(pool, src);
    }

    /// Both sides may be null
    pub fn move_from_allow_both_null(&mut self, pool: &SlicePool, src: &mut SliceFifoBuffer) {
        self.move_from_allow_src_null(pool, src);
    }

    fn move_from_inner(&mut self, pool: &SlicePool, src: &mut SliceFifoBuffer) {
        if src.is_empty() {
            return;
        }
        if self.is_empty() && !self.is_null() {
            // swap storage instead of copying
            std::mem::swap(self, src);
            return;
        }

        let data = src.read(pool);
        let n = self.push(pool, &data);
        src.consume(n);
    }
}

/// A queue of slice FIFO buffers for unbounded staging
#[derive(Default)]
pub struct MultiFifoBuffer {
    buffers: VecDeque<SliceFifoBuffer>,
}

impl MultiFifoBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(|b| b.is_empty())
    }

    /// Total readable bytes
    pub fn available(&self) -> usize {
        self.buffers.iter().map(|b| b.available()).sum()
    }

    /// Append all of `data`, allocating buffers as needed
    pub fn push(&mut self, pool: &SlicePool, mut data: &[u8]) {
        while !data.is_empty() {
            if self.buffers.back().map_or(true, |b| b.is_full(pool)) {
                self.buffers.push_back(SliceFifoBuffer::new());
            }
            let buffer = self.buffers.back_mut().unwrap();
            let n = buffer.push(pool, data);
            data = &data[n..];
        }
    }

    /// The head buffer's readable region
    pub fn read(&self, pool: &SlicePool) -> Bytes {
        match self.buffers.front() {
            None => Bytes::new(),
            Some(buffer) => buffer.read(pool),
        }
    }

    /// Consume from the head, dropping drained buffers
    pub fn consume(&mut self, pool: &SlicePool, mut n: usize) {
        while n > 0 {
            let Some(buffer) = self.buffers.front_mut() else {
                debug_assert!(false, "consuming more than available");
                return;
            };
            let step = n.min(buffer.available());
            buffer.consume(step);
            n -= step;
            if buffer.is_empty() {
                let mut buffer = self.buffers.pop_front().unwrap();
                buffer.free(pool);
            }
        }
    }

    /// Advance without yielding bytes; returns how much was skipped
    pub fn skip(&mut self, pool: &SlicePool, n: usize) -> usize {
        let step = n.min(self.available());
        self.consume(pool, step);
        step
    }

    /// Report every buffer's contents as one contiguous bucket each, so a
    /// downstream reader can traverse them without reassembly
    pub fn fill_bucket_list(&self, pool: &SlicePool) -> Vec<Bytes> {
        self.buffers
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.read(pool))
            .collect()
    }

    /// Release all storage
    pub fn clear(&mut self, pool: &SlicePool) {
        for mut buffer in self.buffers.drain(..) {
            buffer.free(pool);
        }
    }
}
