//! Mapped views over cached buffers.
//!
//! A view aliases the file's buffers; it holds no copy. Writes through it
//! dirty the buffers like a `write` call would, but the flush rules only run
//! at a checkpoint (`sync`, `unmap`, or file close).

use std::ops::Range;
use std::sync::Arc;

use crate::backend::BackendStore;
use crate::buffer::PinGuard;
use crate::error::{CacheError, Result};
use crate::file::{CachedFile, clip_to_eof};

/// A page-aligned window onto a cached file.
pub struct MappedView<B: BackendStore + 'static> {
    file: Arc<CachedFile<B>>,
    start: u64,
    len: usize,
    writable: bool,
    _pins: Vec<PinGuard>,
}

impl<B: BackendStore + 'static> CachedFile<B> {
    /// Map `[offset, offset + len)`. The window starts at `offset` rounded
    /// down to the page size; offsets given to the view are relative to
    /// that start.
    ///
    /// Every buffer covering the mapped part of the file is filled and pinned
    /// for the lifetime of the view.
    pub async fn map(
        self: &Arc<Self>,
        offset: u64,
        len: usize,
        writable: bool,
    ) -> Result<MappedView<B>> {
        if !self.mode.is_buffered() {
            return Err(CacheError::Unsupported("mmap on an uncached file"));
        }
        let end = offset
            .checked_add(len as u64)
            .filter(|_| len > 0)
            .ok_or(CacheError::InvalidRange {
                offset,
                len: len as u64,
            })?;
        let start = offset & !(self.page_size - 1);

        let mut st = self.state.write().await;
        st.ensure_open(self.node)?;
        let mut pins = Vec::new();
        let covered = end.min(st.size);
        if covered > start {
            let first = self.layout.block_of(start);
            let last = self.layout.block_of(covered - 1);
            for block_no in first..=last {
                self.fill_block(&mut st, block_no).await?;
                if let Some(buf) = st.table.peek(block_no) {
                    pins.push(buf.pin());
                }
            }
        }
        trace!(
            "node {}: mapped [{start:#x}, {end:#x}), {} blocks pinned",
            self.node,
            pins.len()
        );
        Ok(MappedView {
            file: self.clone(),
            start,
            len: (end - start) as usize,
            writable,
            _pins: pins,
        })
    }
}

impl<B: BackendStore + 'static> MappedView<B> {
    /// File offset of the first byte of the view.
    pub fn file_offset(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn absolute(&self, rel_off: usize, len: usize) -> Result<u64> {
        match rel_off.checked_add(len) {
            Some(end) if end <= self.len => Ok(self.start + rel_off as u64),
            _ => Err(CacheError::InvalidRange {
                offset: self.start + rel_off as u64,
                len: len as u64,
            }),
        }
    }

    /// Load bytes from the mapping. Anything past end of file reads as zero.
    pub async fn read(&self, rel_off: usize, len: usize) -> Result<Vec<u8>> {
        let offset = self.absolute(rel_off, len)?;
        let mut out = vec![0u8; len];
        {
            let st = self.file.state.read().await;
            st.ensure_open(self.file.node)?;
            let n = clip_to_eof(offset, len, st.size);
            if let Some(cached) = self.file.read_cached(&st, offset, n) {
                out[..n].copy_from_slice(&cached);
                return Ok(out);
            }
        }
        let mut st = self.file.state.write().await;
        st.ensure_open(self.file.node)?;
        let n = clip_to_eof(offset, len, st.size);
        self.file.read_into(&mut st, offset, &mut out[..n]).await?;
        Ok(out)
    }

    /// Store bytes through the mapping. The affected buffers become dirty;
    /// nothing is flushed until the next checkpoint.
    pub async fn write(&self, rel_off: usize, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CacheError::Unsupported("store to a read-only mapping"));
        }
        let offset = self.absolute(rel_off, data.len())?;
        let file = &self.file;
        let mut st = file.state.write().await;
        st.ensure_open(file.node)?;
        let end = offset + data.len() as u64;
        if end > st.size {
            return Err(CacheError::BeyondEof {
                offset: offset.max(st.size),
                size: st.size,
            });
        }

        let mut cursor = 0usize;
        for span in file.layout.spans(offset, data.len()) {
            file.fill_block(&mut st, span.block_no).await?;
            let buf = st
                .table
                .get_mut(span.block_no)
                .ok_or(CacheError::OutOfCacheMemory)?;
            buf.write_at(span.offset_in_block, &data[cursor..cursor + span.len]);
            cursor += span.len;
        }
        Ok(())
    }

    /// Checkpoint: run the cache mode's flush rules over the buffers this
    /// view covers.
    pub async fn sync(&self) -> Result<()> {
        let file = &self.file;
        let mut st = file.state.write().await;
        st.ensure_open(file.node)?;
        let covered = clip_to_eof(self.start, self.len, st.size);
        let touched: Vec<(u64, Range<usize>)> = file
            .layout
            .spans(self.start, covered)
            .iter()
            .map(|s| (s.block_no, s.offset_in_block..s.end_in_block()))
            .collect();
        file.apply_policy(&mut st, &touched).await
    }

    /// Sync and release the mapping.
    pub async fn unmap(self) -> Result<()> {
        self.sync().await
    }
}
