//! Writeback engine: pushes dirty buffer ranges to the backend.
//!
//! Flushes are either synchronous (the caller waits) or, for
//! `WritebackAsync`, queued on the flush pool. A queued flush snapshots its
//! bytes and clears them from the dirty range right away; if it later fails
//! the range is marked dirty again and the error is held for the next
//! `sync` or close. Every synchronous backend request of a file first waits
//! for that file's queued flushes, so requests stay in program order.

use std::ops::Range;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::backend::BackendStore;
use crate::buffer::Buffer;
use crate::error::{CacheError, Result};
use crate::file::{CachedFile, FileState};
use crate::policy::{self, CacheMode, FlushAction};

/// A flush handed to the worker pool and not yet confirmed.
pub(crate) struct PendingFlush {
    block_no: u64,
    range: Range<usize>,
    done: oneshot::Receiver<Result<()>>,
}

impl<B: BackendStore + 'static> CachedFile<B> {
    fn full_block(&self) -> Range<usize> {
        0..self.layout.block_size as usize
    }

    /// Write the dirty part of `block_no` that falls inside `range` and
    /// shrink the dirty range accordingly. On error the dirty range is left
    /// as it was.
    pub(crate) async fn flush_block(
        &self,
        st: &mut FileState,
        block_no: u64,
        range: Range<usize>,
    ) -> Result<()> {
        self.settle(st).await;
        let limit = self.layout.valid_len(block_no, st.size);
        let Some(buf) = st.table.get_mut(block_no) else {
            return Ok(());
        };
        let dirty = buf.dirty_range();
        let lo = dirty.start.max(range.start);
        let hi = dirty.end.min(range.end).min(limit);
        if lo >= hi {
            return Ok(());
        }

        let at = self.layout.block_start(block_no) + lo as u64;
        self.client.write(self.node, at, buf.bytes(lo..hi)).await?;
        buf.clean(lo, hi);
        self.counters.sync_flush();
        trace!(
            "node {}: flushed block {block_no} [{lo:#x}, {hi:#x})",
            self.node
        );
        Ok(())
    }

    /// Queue the whole dirty range of `block_no` on the flush pool. Falls
    /// back to a synchronous flush once the pool is shut down.
    pub(crate) async fn dispatch_flush(&self, st: &mut FileState, block_no: u64) -> Result<()> {
        let limit = self.layout.valid_len(block_no, st.size);
        let Some(dirty) = st.table.peek(block_no).map(Buffer::dirty_range) else {
            return Ok(());
        };
        let (lo, hi) = (dirty.start, dirty.end.min(limit));
        if lo >= hi {
            return Ok(());
        }
        if !self.pool.is_running() {
            return self.flush_block(st, block_no, lo..hi).await;
        }

        let Some(buf) = st.table.get_mut(block_no) else {
            return Ok(());
        };
        let data = Bytes::copy_from_slice(buf.bytes(lo..hi));
        let client = self.client.clone();
        let node = self.node;
        let at = self.layout.block_start(block_no) + lo as u64;
        let submitted = self
            .pool
            .submit(node, async move { client.write(node, at, &data).await });
        match submitted {
            Ok(done) => {
                buf.clean(lo, hi);
                st.inflight.push(PendingFlush {
                    block_no,
                    range: lo..hi,
                    done,
                });
                self.counters.async_flush();
                trace!(
                    "node {node}: queued flush of block {block_no} [{lo:#x}, {hi:#x})"
                );
                Ok(())
            }
            Err(CacheError::WorkerShutdown) => self.flush_block(st, block_no, lo..hi).await,
            Err(e) => Err(e),
        }
    }

    /// Wait for every queued flush of this file. Failed ones are re-marked
    /// dirty and the first failure is kept for the next checkpoint.
    pub(crate) async fn settle(&self, st: &mut FileState) {
        if st.inflight.is_empty() {
            return;
        }
        for pending in std::mem::take(&mut st.inflight) {
            let outcome = pending
                .done
                .await
                .unwrap_or(Err(CacheError::WorkerShutdown));
            if let Err(e) = outcome {
                warn!(
                    "node {}: queued flush of block {} failed: {e}",
                    self.node, pending.block_no
                );
                let limit = self.layout.valid_len(pending.block_no, st.size);
                if let Some(buf) = st.table.get_mut(pending.block_no) {
                    buf.mark_dirty(pending.range.start, pending.range.end.min(limit));
                }
                st.deferred_error.get_or_insert(e);
            }
        }
    }

    /// Last-block rule: a dirty buffer holding the end-of-file offset is
    /// flushed before the triggering operation returns.
    pub(crate) async fn flush_last_block(&self, st: &mut FileState) -> Result<()> {
        if !self.mode.is_buffered() {
            return Ok(());
        }
        let Some(last) = self.layout.last_block(st.size) else {
            return Ok(());
        };
        if st.table.peek(last).is_some_and(Buffer::is_dirty) {
            debug!("node {}: flushing last block {last}", self.node);
            self.flush_block(st, last, self.full_block()).await?;
        }
        Ok(())
    }

    /// Apply the cache mode to freshly dirtied buffers. `touched` pairs each
    /// block with the range just written in it.
    pub(crate) async fn apply_policy(
        &self,
        st: &mut FileState,
        touched: &[(u64, Range<usize>)],
    ) -> Result<()> {
        let last = self.layout.last_block(st.size);
        for (block_no, written) in touched {
            let Some(buf) = st.table.peek(*block_no) else {
                // evicted, which means already flushed
                continue;
            };
            if !buf.is_dirty() {
                continue;
            }
            let is_last = last == Some(*block_no);
            match policy::after_write(self.mode, is_last, buf.is_fully_dirty()) {
                FlushAction::Defer => {}
                FlushAction::Sync if self.mode == CacheMode::Writethrough => {
                    self.flush_block(st, *block_no, written.clone()).await?;
                }
                FlushAction::Sync => {
                    self.flush_block(st, *block_no, self.full_block()).await?;
                }
                FlushAction::Async => self.dispatch_flush(st, *block_no).await?,
            }
        }
        self.flush_last_block(st).await
    }

    /// Flush every dirty buffer and report any held asynchronous failure.
    pub(crate) async fn flush_all(&self, st: &mut FileState) -> Result<()> {
        self.settle(st).await;
        let mut first_err = None;
        for block_no in st.table.dirty_blocks() {
            if let Err(e) = self.flush_block(st, block_no, self.full_block()).await {
                error!("node {}: flush of block {block_no} failed: {e}", self.node);
                first_err.get_or_insert(e);
            }
        }
        // a failure from before this call was observed first
        match st.deferred_error.take().or(first_err) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// fsync: make every write so far durable on the backend.
    pub async fn sync(&self) -> Result<()> {
        let mut st = self.state.write().await;
        st.ensure_open(self.node)?;
        if !self.mode.is_buffered() {
            return Ok(());
        }
        self.flush_all(&mut st).await
    }
}
