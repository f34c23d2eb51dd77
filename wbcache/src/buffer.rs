//! A single cached block: data, validity and the not-yet-flushed range.
//!
//! Invariants:
//! - `0 <= dirty_off <= dirty_end <= block_size`; clean means the two are equal.
//! - a dirty buffer is always valid (partial writes fill first).
//! - bytes at or beyond the owning file's size are zero.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    valid: bool,
    dirty_off: usize,
    dirty_end: usize,
    pins: Arc<AtomicUsize>,
}

/// Keeps a buffer from being evicted while a mapped view covers it.
#[derive(Debug)]
pub struct PinGuard {
    pins: Arc<AtomicUsize>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Buffer {
    pub fn new(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size],
            valid: false,
            dirty_off: 0,
            dirty_end: 0,
            pins: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn block_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_end > self.dirty_off
    }

    /// Dirty across the whole block.
    pub fn is_fully_dirty(&self) -> bool {
        self.dirty_off == 0 && self.dirty_end == self.data.len()
    }

    pub fn dirty_range(&self) -> Range<usize> {
        self.dirty_off..self.dirty_end
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub fn pin(&self) -> PinGuard {
        self.pins.fetch_add(1, Ordering::AcqRel);
        PinGuard {
            pins: self.pins.clone(),
        }
    }

    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        &self.data[range]
    }

    /// Install backend contents: `fetched` lands at the start of the block and
    /// the remainder is a hole.
    pub fn fill_from(&mut self, fetched: &[u8]) {
        let n = fetched.len().min(self.data.len());
        self.data[..n].copy_from_slice(&fetched[..n]);
        self.data[n..].fill(0);
        self.valid = true;
    }

    /// Copy `src` in at `offset` and extend the dirty range to cover it.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        let end = offset + src.len();
        debug_assert!(end <= self.data.len(), "write exceeds block boundary");
        self.data[offset..end].copy_from_slice(src);
        if offset == 0 && end == self.data.len() {
            self.valid = true;
        }
        self.mark_dirty(offset, end);
    }

    /// Union `[off, end)` into the dirty range.
    pub fn mark_dirty(&mut self, off: usize, end: usize) {
        if off >= end {
            return;
        }
        if self.is_dirty() {
            self.dirty_off = self.dirty_off.min(off);
            self.dirty_end = self.dirty_end.max(end);
        } else {
            self.dirty_off = off;
            self.dirty_end = end;
        }
    }

    /// Drop `[lo, hi)` from the dirty range after it reached the backend.
    ///
    /// A single range cannot hold a hole, so cleaning the middle of the dirty
    /// range leaves it unchanged; re-flushing those bytes is harmless.
    pub fn clean(&mut self, lo: usize, hi: usize) {
        if !self.is_dirty() || lo >= hi {
            return;
        }
        if lo <= self.dirty_off {
            self.dirty_off = self.dirty_off.max(hi);
        } else if hi >= self.dirty_end {
            self.dirty_end = self.dirty_end.min(lo);
        }
        if self.dirty_off >= self.dirty_end {
            self.dirty_off = 0;
            self.dirty_end = 0;
        }
    }

    /// Cut the buffer at `limit`: bytes past it become zero and leave the
    /// dirty range.
    pub fn truncate_at(&mut self, limit: usize) {
        let limit = limit.min(self.data.len());
        self.data[limit..].fill(0);
        self.dirty_end = self.dirty_end.min(limit);
        if self.dirty_off >= self.dirty_end {
            self.dirty_off = 0;
            self.dirty_end = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_writes_accumulate_dirty_range() {
        let mut buf = Buffer::new(64);
        buf.fill_from(&[]);
        buf.write_at(40, &[1; 8]);
        buf.write_at(4, &[2; 4]);
        assert_eq!(buf.dirty_range(), 4..48);
        assert!(!buf.is_fully_dirty());
        assert_eq!(buf.bytes(4..8), &[2; 4]);
    }

    #[test]
    fn test_full_overwrite_validates() {
        let mut buf = Buffer::new(16);
        assert!(!buf.is_valid());
        buf.write_at(0, &[9; 16]);
        assert!(buf.is_valid());
        assert!(buf.is_fully_dirty());
    }

    #[test]
    fn test_clean_prefix_suffix_and_middle() {
        let mut buf = Buffer::new(64);
        buf.mark_dirty(10, 50);
        buf.clean(0, 20);
        assert_eq!(buf.dirty_range(), 20..50);
        buf.clean(40, 64);
        assert_eq!(buf.dirty_range(), 20..40);
        buf.clean(25, 30);
        assert_eq!(buf.dirty_range(), 20..40);
        buf.clean(20, 40);
        assert!(!buf.is_dirty());
    }

    #[test]
    fn test_truncate_clips_dirty_and_zeroes_tail() {
        let mut buf = Buffer::new(32);
        buf.write_at(0, &[7; 32]);
        buf.truncate_at(12);
        assert_eq!(buf.dirty_range(), 0..12);
        assert!(buf.bytes(12..32).iter().all(|&b| b == 0));

        let mut buf = Buffer::new(32);
        buf.fill_from(&[]);
        buf.write_at(20, &[7; 4]);
        buf.truncate_at(16);
        assert!(!buf.is_dirty());
    }

    #[test]
    fn test_fill_zero_fills_short_read() {
        let mut buf = Buffer::new(8);
        buf.fill_from(&[1, 2, 3]);
        assert!(buf.is_valid());
        assert!(!buf.is_dirty());
        assert_eq!(buf.bytes(0..8), &[1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_pin_guard_releases_on_drop() {
        let buf = Buffer::new(8);
        let a = buf.pin();
        let b = buf.pin();
        assert!(buf.is_pinned());
        drop(a);
        assert!(buf.is_pinned());
        drop(b);
        assert!(!buf.is_pinned());
    }
}
