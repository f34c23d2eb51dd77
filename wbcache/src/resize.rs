//! Truncate and extend.
//!
//! The backend resize is authoritative and happens before any buffer is
//! touched; if it fails the file is left exactly as it was.

use crate::backend::BackendStore;
use crate::error::Result;
use crate::file::{CachedFile, FileState};

impl<B: BackendStore + 'static> CachedFile<B> {
    /// Resize the file to `new_size`.
    ///
    /// A dirty end-of-file block is flushed before the resize so that data
    /// written just before it cannot be lost by clipping. Shrinking discards
    /// buffers past the cut, dirty or not, and zeroes the tail of the
    /// buffer straddling it.
    pub async fn set_size(&self, new_size: u64) -> Result<()> {
        let mut st = self.state.write().await;
        st.ensure_open(self.node)?;

        if !self.mode.is_buffered() {
            self.client.set_size(self.node, new_size).await?;
            st.size = new_size;
            return Ok(());
        }

        self.settle(&mut st).await;
        self.flush_last_block(&mut st).await?;

        let old_size = st.size;
        self.client.set_size(self.node, new_size).await?;
        debug!(
            "node {}: resized {old_size:#x} -> {new_size:#x}",
            self.node
        );
        if new_size < old_size {
            self.shrink_buffers(&mut st, new_size);
        }
        st.size = new_size;

        // a shrink may have made a dirty buffer the last block
        self.flush_last_block(&mut st).await
    }

    fn shrink_buffers(&self, st: &mut FileState, new_size: u64) {
        for block_no in st.table.block_numbers() {
            let start = self.layout.block_start(block_no);
            if start >= new_size {
                if st.table.remove(block_no).is_some_and(|b| b.is_dirty()) {
                    trace!(
                        "node {}: dropped dirty block {block_no} past new size",
                        self.node
                    );
                }
            } else if let Some(buf) = st.table.get_mut(block_no) {
                let limit = self.layout.valid_len(block_no, new_size);
                if limit < buf.block_size() {
                    buf.truncate_at(limit);
                }
            }
        }
    }
}
