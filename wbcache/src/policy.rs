//! Cache modes and the flush decisions they imply.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::layout::BlockLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// No buffering: every request goes straight to the backend.
    Uncached,
    /// Buffered, and each write is flushed before it returns.
    Writethrough,
    /// Buffered, flushed later on specific events.
    Writeback,
    /// Like `Writeback`, but some flushes run on the worker pool.
    WritebackAsync,
}

impl CacheMode {
    pub const ALL: [CacheMode; 4] = [
        CacheMode::Uncached,
        CacheMode::Writethrough,
        CacheMode::Writeback,
        CacheMode::WritebackAsync,
    ];

    pub fn is_buffered(self) -> bool {
        !matches!(self, CacheMode::Uncached)
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheMode::Uncached => "uncached",
            CacheMode::Writethrough => "writethrough",
            CacheMode::Writeback => "writeback",
            CacheMode::WritebackAsync => "writeback_async",
        };
        f.write_str(s)
    }
}

impl FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncached" => Ok(CacheMode::Uncached),
            "writethrough" => Ok(CacheMode::Writethrough),
            "writeback" => Ok(CacheMode::Writeback),
            "writeback_async" | "writeback-async" => Ok(CacheMode::WritebackAsync),
            other => Err(format!("unknown cache mode: {other}")),
        }
    }
}

/// What to do with a buffer once a write (or a mapped-view sync) has
/// dirtied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAction {
    /// Leave it dirty.
    Defer,
    /// Flush before the triggering call returns.
    Sync,
    /// Hand the flush to the worker pool.
    Async,
}

/// Decide the flush for one buffer after it was dirtied.
///
/// The last-block rule wins over everything but `Uncached`, which never
/// buffers in the first place.
pub fn after_write(mode: CacheMode, is_last_block: bool, fully_dirty: bool) -> FlushAction {
    match mode {
        CacheMode::Uncached => FlushAction::Defer,
        CacheMode::Writethrough => FlushAction::Sync,
        _ if is_last_block => FlushAction::Sync,
        CacheMode::WritebackAsync if fully_dirty => FlushAction::Async,
        CacheMode::Writeback | CacheMode::WritebackAsync => FlushAction::Defer,
    }
}

/// Whether `block_no` is the last block of a file of `size` bytes, i.e. its
/// range holds the end-of-file offset.
pub fn is_last_block(layout: BlockLayout, block_no: u64, size: u64) -> bool {
    layout.last_block(size) == Some(block_no)
}
