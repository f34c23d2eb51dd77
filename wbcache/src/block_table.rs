//! Per-file block table with a cache-wide buffer budget.
//!
//! Each open file owns one table keyed by logical block number, so there is
//! never more than one buffer per (file, block). Allocation draws from a
//! [`BufferBudget`] shared by every file of a cache; when the budget is
//! exhausted the caller evicts clean buffers (least recently used first)
//! and retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lru::LruCache;

use crate::buffer::Buffer;
use crate::error::{CacheError, Result};

/// Cache-wide cap on the number of live buffers.
#[derive(Debug)]
pub struct BufferBudget {
    limit: usize,
    used: AtomicUsize,
}

impl BufferBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self, n: usize) {
        self.used.fetch_sub(n, Ordering::AcqRel);
    }
}

pub struct BlockTable {
    block_size: usize,
    buffers: LruCache<u64, Buffer>,
    budget: Arc<BufferBudget>,
}

impl BlockTable {
    pub fn new(block_size: usize, budget: Arc<BufferBudget>) -> Self {
        Self {
            block_size,
            buffers: LruCache::unbounded(),
            budget,
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn contains(&self, block_no: u64) -> bool {
        self.buffers.contains(&block_no)
    }

    /// Lookup without touching recency.
    pub fn peek(&self, block_no: u64) -> Option<&Buffer> {
        self.buffers.peek(&block_no)
    }

    pub fn get_mut(&mut self, block_no: u64) -> Option<&mut Buffer> {
        self.buffers.get_mut(&block_no)
    }

    /// Existing buffer for `block_no`, or a new zeroed (invalid) one.
    ///
    /// Fails with [`CacheError::OutOfCacheMemory`] when the budget is spent;
    /// nothing is evicted here.
    pub fn get_or_create(&mut self, block_no: u64) -> Result<&mut Buffer> {
        if !self.buffers.contains(&block_no) {
            if !self.budget.try_acquire() {
                return Err(CacheError::OutOfCacheMemory);
            }
            self.buffers.put(block_no, Buffer::new(self.block_size));
        }
        self.buffers
            .get_mut(&block_no)
            .ok_or(CacheError::OutOfCacheMemory)
    }

    /// Discard a buffer. Callers only remove clean buffers, or dirty ones
    /// that a shrink has put beyond end of file.
    pub fn remove(&mut self, block_no: u64) -> Option<Buffer> {
        let removed = self.buffers.pop(&block_no);
        if removed.is_some() {
            self.budget.release(1);
        }
        removed
    }

    /// Block numbers in ascending order.
    pub fn block_numbers(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = self.buffers.iter().map(|(b, _)| *b).collect();
        blocks.sort_unstable();
        blocks
    }

    pub fn dirty_blocks(&self) -> Vec<u64> {
        let mut blocks: Vec<u64> = self
            .buffers
            .iter()
            .filter(|(_, buf)| buf.is_dirty())
            .map(|(b, _)| *b)
            .collect();
        blocks.sort_unstable();
        blocks
    }

    /// Least recently used unpinned buffer that is clean.
    pub fn eviction_candidate(&self) -> Option<u64> {
        self.buffers
            .iter()
            .rev()
            .find(|(_, buf)| !buf.is_dirty() && !buf.is_pinned())
            .map(|(b, _)| *b)
    }

    /// Least recently used unpinned buffer that is dirty; it must be flushed
    /// before it can be evicted.
    pub fn flush_candidate(&self) -> Option<u64> {
        self.buffers
            .iter()
            .rev()
            .find(|(_, buf)| buf.is_dirty() && !buf.is_pinned())
            .map(|(b, _)| *b)
    }

    /// Evict up to `n` clean buffers; returns how many went.
    pub fn evict_clean(&mut self, n: usize) -> usize {
        let mut evicted = 0;
        while evicted < n {
            let Some(block_no) = self.eviction_candidate() else {
                break;
            };
            self.remove(block_no);
            evicted += 1;
        }
        evicted
    }
}

impl Drop for BlockTable {
    fn drop(&mut self) {
        self.budget.release(self.buffers.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_most_one_buffer_per_block() {
        let budget = Arc::new(BufferBudget::new(8));
        let mut table = BlockTable::new(16, budget.clone());
        table.get_or_create(3).unwrap().write_at(0, &[1; 4]);
        let again = table.get_or_create(3).unwrap();
        assert_eq!(again.bytes(0..4), &[1; 4]);
        assert_eq!(table.len(), 1);
        assert_eq!(budget.in_use(), 1);
    }

    #[test]
    fn test_budget_exhaustion_and_clean_eviction() {
        let budget = Arc::new(BufferBudget::new(2));
        let mut table = BlockTable::new(16, budget.clone());
        table.get_or_create(0).unwrap().fill_from(&[]);
        table.get_or_create(1).unwrap().write_at(0, &[1; 16]);
        assert_eq!(
            table.get_or_create(2).unwrap_err(),
            CacheError::OutOfCacheMemory
        );

        // block 1 is dirty and must survive
        assert_eq!(table.evict_clean(2), 1);
        assert!(table.contains(1));
        assert!(!table.contains(0));
        assert!(table.get_or_create(2).is_ok());
        assert_eq!(table.evict_clean(1), 1);
        assert_eq!(table.flush_candidate(), Some(1));
    }

    #[test]
    fn test_pinned_buffers_are_not_candidates() {
        let budget = Arc::new(BufferBudget::new(4));
        let mut table = BlockTable::new(16, budget);
        table.get_or_create(0).unwrap();
        let _pin = table.peek(0).unwrap().pin();
        assert_eq!(table.eviction_candidate(), None);
        assert_eq!(table.evict_clean(1), 0);
    }

    #[test]
    fn test_drop_returns_budget() {
        let budget = Arc::new(BufferBudget::new(4));
        {
            let mut table = BlockTable::new(16, budget.clone());
            table.get_or_create(0).unwrap();
            table.get_or_create(5).unwrap();
            table.remove(0);
            assert_eq!(budget.in_use(), 1);
            assert_eq!(table.block_numbers(), vec![5]);
        }
        assert_eq!(budget.in_use(), 0);
    }
}
