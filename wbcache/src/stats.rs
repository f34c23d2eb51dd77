use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::BackendStats;

#[derive(Debug, Default)]
pub(crate) struct EngineCounters {
    sync_flushes: AtomicU64,
    async_flushes: AtomicU64,
    evictions: AtomicU64,
}

impl EngineCounters {
    pub(crate) fn sync_flush(&self) {
        self.sync_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn async_flush(&self) {
        self.async_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, backend: BackendStats, buffers_in_use: usize) -> CacheStats {
        CacheStats {
            backend_reads: backend.reads,
            backend_writes: backend.writes,
            bytes_written: backend.bytes_written,
            resizes: backend.resizes,
            sync_flushes: self.sync_flushes.load(Ordering::Relaxed),
            async_flushes: self.async_flushes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            buffers_in_use,
        }
    }
}

/// Point-in-time counters for a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Read requests sent to the backend.
    pub backend_reads: u64,
    /// Write requests sent to the backend (after splitting at `max_write`).
    pub backend_writes: u64,
    pub bytes_written: u64,
    pub resizes: u64,
    pub sync_flushes: u64,
    pub async_flushes: u64,
    pub evictions: u64,
    pub buffers_in_use: usize,
}
