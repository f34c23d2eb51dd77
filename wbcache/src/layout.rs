//! Block geometry: maps file byte ranges onto logical blocks.

/// Fixed block size used as the cache granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u64,
}

/// A file range restricted to a single logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub block_no: u64,
    pub offset_in_block: usize,
    pub len: usize,
}

impl BlockSpan {
    pub fn end_in_block(&self) -> usize {
        self.offset_in_block + self.len
    }
}

impl BlockLayout {
    pub fn new(block_size: u64) -> Self {
        Self { block_size }
    }

    pub fn block_of(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    pub fn block_start(&self, block_no: u64) -> u64 {
        block_no * self.block_size
    }

    pub fn block_end(&self, block_no: u64) -> u64 {
        self.block_start(block_no) + self.block_size
    }

    /// The block holding the final byte of a file of `size` bytes.
    pub fn last_block(&self, size: u64) -> Option<u64> {
        if size == 0 {
            None
        } else {
            Some(self.block_of(size - 1))
        }
    }

    /// Number of bytes of `block_no` that lie inside a file of `size` bytes.
    pub fn valid_len(&self, block_no: u64, size: u64) -> usize {
        let start = self.block_start(block_no);
        if size <= start {
            0
        } else {
            (size - start).min(self.block_size) as usize
        }
    }

    /// Split `[offset, offset + len)` into per-block spans, in offset order.
    pub fn spans(&self, mut offset: u64, len: usize) -> Vec<BlockSpan> {
        let mut remaining = len as u64;
        let mut out = Vec::new();
        while remaining > 0 {
            let block_no = self.block_of(offset);
            let offset_in_block = offset - self.block_start(block_no);
            let take = (self.block_size - offset_in_block).min(remaining);
            out.push(BlockSpan {
                block_no,
                offset_in_block: offset_in_block as usize,
                len: take as usize,
            });
            offset += take;
            remaining -= take;
        }
        out
    }
}
