//! An open file: size, cache mode and its block table, plus the buffered
//! read/write paths.
//!
//! All state sits behind one per-file `RwLock`. Reads that hit valid buffers
//! share the read side; anything that fills, dirties, flushes or resizes
//! takes the write side, so operations on one buffer never interleave.
//!
//! The buffer budget is shared by every file of a cache, so a file that runs
//! out may evict from another open file. It then holds two state locks. A
//! file waits for the lock of a peer with a higher node id and only tries
//! the lock of a lower one, skipping it when busy. Locks are therefore only
//! ever awaited in ascending node order.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::backend::{BackendClient, BackendStore, NodeId};
use crate::block_table::{BlockTable, BufferBudget};
use crate::error::{CacheError, Result};
use crate::layout::{BlockLayout, BlockSpan};
use crate::policy::CacheMode;
use crate::stats::EngineCounters;
use crate::worker::FlushPool;
use crate::writeback::PendingFlush;

pub(crate) struct FileState {
    pub(crate) size: u64,
    pub(crate) table: BlockTable,
    pub(crate) inflight: Vec<PendingFlush>,
    /// First failure of an asynchronous flush, reported at the next sync or
    /// close.
    pub(crate) deferred_error: Option<CacheError>,
    pub(crate) opens: usize,
    pub(crate) closed: bool,
}

impl FileState {
    pub(crate) fn ensure_open(&self, node: NodeId) -> Result<()> {
        if self.closed {
            Err(CacheError::NotOpen(node))
        } else {
            Ok(())
        }
    }
}

pub struct CachedFile<B: BackendStore + 'static> {
    pub(crate) node: NodeId,
    pub(crate) mode: CacheMode,
    pub(crate) layout: BlockLayout,
    pub(crate) page_size: u64,
    pub(crate) client: Arc<BackendClient<B>>,
    pub(crate) pool: Arc<FlushPool>,
    pub(crate) counters: Arc<EngineCounters>,
    peers: Arc<Peers<B>>,
    pub(crate) state: RwLock<FileState>,
}

/// Shared handle to an open file.
pub type FileHandle<B> = Arc<CachedFile<B>>;

/// Every open file of one cache, by node.
pub(crate) type Peers<B> = std::sync::Mutex<HashMap<NodeId, Weak<CachedFile<B>>>>;

impl<B: BackendStore + 'static> CachedFile<B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node: NodeId,
        mode: CacheMode,
        size: u64,
        layout: BlockLayout,
        page_size: u64,
        client: Arc<BackendClient<B>>,
        pool: Arc<FlushPool>,
        counters: Arc<EngineCounters>,
        budget: Arc<BufferBudget>,
        peers: Arc<Peers<B>>,
    ) -> Self {
        Self {
            node,
            mode,
            layout,
            page_size,
            client,
            pool,
            counters,
            peers,
            state: RwLock::new(FileState {
                size,
                table: BlockTable::new(layout.block_size as usize, budget),
                inflight: Vec::new(),
                deferred_error: None,
                opens: 1,
                closed: false,
            }),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn mode(&self) -> CacheMode {
        self.mode
    }

    pub async fn size(&self) -> u64 {
        self.state.read().await.size
    }

    /// Number of buffers currently cached for this file.
    pub async fn cached_blocks(&self) -> usize {
        self.state.read().await.table.len()
    }

    /// Read up to `len` bytes at `offset`. Cached reads stop at end of file.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if !self.mode.is_buffered() {
            let st = self.state.read().await;
            st.ensure_open(self.node)?;
            return self.client.read(self.node, offset, len).await;
        }

        {
            let st = self.state.read().await;
            st.ensure_open(self.node)?;
            let len = clip_to_eof(offset, len, st.size);
            if let Some(out) = self.read_cached(&st, offset, len) {
                return Ok(out);
            }
        }

        let mut st = self.state.write().await;
        st.ensure_open(self.node)?;
        let len = clip_to_eof(offset, len, st.size);
        let mut out = vec![0u8; len];
        self.read_into(&mut st, offset, &mut out).await?;
        Ok(out)
    }

    /// Write `data` at `offset`, extending the file if needed, then apply the
    /// cache mode's flush rules before returning.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut st = self.state.write().await;
        st.ensure_open(self.node)?;
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(CacheError::InvalidRange {
                offset,
                len: data.len() as u64,
            })?;

        if !self.mode.is_buffered() {
            self.client.write(self.node, offset, data).await?;
            st.size = st.size.max(end);
            return Ok(data.len());
        }

        let spans = self.layout.spans(offset, data.len());
        let mut cursor = 0usize;
        for span in &spans {
            let src = &data[cursor..cursor + span.len];
            if let Err(e) = self.write_span(&mut st, span, src).await {
                // bytes already copied are part of the file now
                st.size = st.size.max(offset + cursor as u64);
                return Err(e);
            }
            cursor += span.len;
        }
        st.size = st.size.max(end);

        let touched: Vec<(u64, std::ops::Range<usize>)> = spans
            .iter()
            .map(|s| (s.block_no, s.offset_in_block..s.end_in_block()))
            .collect();
        self.apply_policy(&mut st, &touched).await?;
        Ok(data.len())
    }

    async fn write_span(&self, st: &mut FileState, span: &BlockSpan, src: &[u8]) -> Result<()> {
        let whole_block = span.offset_in_block == 0 && span.len as u64 == self.layout.block_size;
        if whole_block {
            self.ensure_buffer(st, span.block_no).await?;
        } else {
            // read-modify-write
            self.fill_block(st, span.block_no).await?;
        }
        let buf = st
            .table
            .get_mut(span.block_no)
            .ok_or(CacheError::OutOfCacheMemory)?;
        buf.write_at(span.offset_in_block, src);
        Ok(())
    }

    /// Serve a read from valid buffers only; `None` if anything is missing.
    pub(crate) fn read_cached(&self, st: &FileState, offset: u64, len: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for span in self.layout.spans(offset, len) {
            let range = span.offset_in_block..span.end_in_block();
            match st.table.peek(span.block_no) {
                Some(buf) if buf.is_valid() => out.extend_from_slice(buf.bytes(range)),
                None if self.layout.valid_len(span.block_no, st.size) == 0 => {
                    out.resize(out.len() + span.len, 0)
                }
                _ => return None,
            }
        }
        Some(out)
    }

    /// Copy `[offset, offset + out.len())` out of the cache, filling buffers
    /// as needed. Blocks wholly past end of file read as zeros.
    pub(crate) async fn read_into(
        &self,
        st: &mut FileState,
        offset: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let mut cursor = 0usize;
        for span in self.layout.spans(offset, out.len()) {
            let dst = &mut out[cursor..cursor + span.len];
            cursor += span.len;
            if self.layout.valid_len(span.block_no, st.size) == 0
                && !st.table.contains(span.block_no)
            {
                dst.fill(0);
                continue;
            }
            self.fill_block(st, span.block_no).await?;
            let buf = st
                .table
                .peek(span.block_no)
                .ok_or(CacheError::OutOfCacheMemory)?;
            dst.copy_from_slice(buf.bytes(span.offset_in_block..span.end_in_block()));
        }
        Ok(())
    }

    /// Make the buffer for `block_no` exist and be valid.
    ///
    /// Reads the part of the block inside the file from the backend and
    /// zero-fills the rest (holes and anything past end of file).
    pub(crate) async fn fill_block(&self, st: &mut FileState, block_no: u64) -> Result<()> {
        if let Some(buf) = st.table.get_mut(block_no) {
            if buf.is_valid() {
                return Ok(());
            }
        }
        // backend reads must not overtake queued flushes
        self.settle(st).await;
        let created = !st.table.contains(block_no);
        self.ensure_buffer(st, block_no).await?;

        let want = self.layout.valid_len(block_no, st.size);
        let fetched = if want == 0 {
            Vec::new()
        } else {
            match self
                .client
                .read(self.node, self.layout.block_start(block_no), want)
                .await
            {
                Ok(data) => data,
                Err(e) => {
                    if created {
                        st.table.remove(block_no);
                    }
                    return Err(e);
                }
            }
        };
        trace!(
            "node {}: filled block {block_no} with {} of {want} bytes",
            self.node,
            fetched.len()
        );
        let buf = st
            .table
            .get_mut(block_no)
            .ok_or(CacheError::OutOfCacheMemory)?;
        buf.fill_from(&fetched[..fetched.len().min(want)]);
        Ok(())
    }

    /// Make sure a buffer exists for `block_no`, evicting if the budget is
    /// spent.
    pub(crate) async fn ensure_buffer(&self, st: &mut FileState, block_no: u64) -> Result<()> {
        loop {
            let res = st.table.get_or_create(block_no).map(|_| ());
            match res {
                Ok(()) => return Ok(()),
                Err(CacheError::OutOfCacheMemory) => self.make_room(st, block_no).await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Free one buffer slot anywhere in the cache. Clean buffers go first,
    /// this file's then other files'; only then is a dirty buffer flushed
    /// and evicted, again starting with this file.
    async fn make_room(&self, st: &mut FileState, wanted: u64) -> Result<()> {
        // an evicted block may be re-read; its queued flushes must land first
        self.settle(st).await;
        if st.table.evict_clean(1) > 0 {
            self.counters.eviction();
            debug!(
                "node {}: evicted a clean block for block {wanted}",
                self.node
            );
            return Ok(());
        }

        let peers = self.open_peers();
        for peer in &peers {
            let Some(mut other) = self.lock_peer(peer).await else {
                continue;
            };
            if other.table.is_empty() {
                continue;
            }
            peer.settle(&mut other).await;
            if other.table.evict_clean(1) > 0 {
                self.counters.eviction();
                debug!(
                    "node {}: evicted a clean block of node {} for block {wanted}",
                    self.node, peer.node
                );
                return Ok(());
            }
        }

        if self.evict_dirty(st).await? {
            return Ok(());
        }
        for peer in &peers {
            let Some(mut other) = self.lock_peer(peer).await else {
                continue;
            };
            match peer.evict_dirty(&mut other).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                // the peer keeps its dirty data; another victim may do
                Err(e) => warn!(
                    "node {}: flushing node {} to make room failed: {e}",
                    self.node, peer.node
                ),
            }
        }
        warn!(
            "node {}: no buffer can be evicted for block {wanted}",
            self.node
        );
        Err(CacheError::OutOfCacheMemory)
    }

    /// Flush the least recently used unpinned dirty buffer, then evict it.
    async fn evict_dirty(&self, st: &mut FileState) -> Result<bool> {
        let Some(victim) = st.table.flush_candidate() else {
            return Ok(false);
        };
        self.flush_block(st, victim, 0..self.layout.block_size as usize)
            .await?;
        if st.table.peek(victim).is_some_and(|b| !b.is_dirty()) {
            st.table.remove(victim);
            self.counters.eviction();
            debug!("node {}: flushed and evicted block {victim}", self.node);
            return Ok(true);
        }
        Ok(false)
    }

    /// Other open files in ascending node order.
    fn open_peers(&self) -> Vec<FileHandle<B>> {
        let peers = match self.peers.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<FileHandle<B>> = peers
            .iter()
            .filter(|(node, _)| **node != self.node)
            .filter_map(|(_, file)| file.upgrade())
            .collect();
        out.sort_by_key(|f| f.node);
        out
    }

    async fn lock_peer<'a>(
        &self,
        peer: &'a CachedFile<B>,
    ) -> Option<RwLockWriteGuard<'a, FileState>> {
        if peer.node > self.node {
            Some(peer.state.write().await)
        } else {
            peer.state.try_write().ok()
        }
    }

    /// Drop this open reference. The last close flushes everything, waits for
    /// queued flushes, notifies the backend and tears the buffers down.
    ///
    /// Returns whether this was the last reference.
    pub(crate) async fn close(&self) -> (Result<()>, bool) {
        let mut st = self.state.write().await;
        if let Err(e) = st.ensure_open(self.node) {
            return (Err(e), false);
        }
        let result = if self.mode.is_buffered() {
            self.flush_all(&mut st).await
        } else {
            Ok(())
        };
        st.opens = st.opens.saturating_sub(1);
        if st.opens > 0 {
            return (result, false);
        }

        if let Err(e) = &result {
            error!("node {}: flush failed at close: {e}", self.node);
        }
        self.client.close_notify(self.node).await;
        for block_no in st.table.block_numbers() {
            st.table.remove(block_no);
        }
        st.closed = true;
        debug!("node {}: closed", self.node);
        (result, true)
    }
}

pub(crate) fn clip_to_eof(offset: u64, len: usize, size: u64) -> usize {
    if offset >= size {
        0
    } else {
        (size - offset).min(len as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_to_eof() {
        assert_eq!(clip_to_eof(0, 10, 5), 5);
        assert_eq!(clip_to_eof(5, 10, 5), 0);
        assert_eq!(clip_to_eof(9, 10, 5), 0);
        assert_eq!(clip_to_eof(2, 2, 5), 2);
    }
}
