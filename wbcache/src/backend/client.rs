//! High-level client used by the cache to talk to a [`BackendStore`].
//!
//! Splits transfers at the configured limits, turns short writes into
//! errors and keeps request counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Attrs, BackendStore, NodeId};
use crate::error::{CacheError, Result};

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_written: AtomicU64,
    resizes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_written: u64,
    pub resizes: u64,
}

pub struct BackendClient<B: BackendStore> {
    store: Arc<B>,
    max_read: usize,
    max_write: usize,
    counters: Counters,
}

impl<B: BackendStore> BackendClient<B> {
    pub fn new(store: Arc<B>, max_read: usize, max_write: usize) -> Self {
        Self {
            store,
            max_read: max_read.max(1),
            max_write: max_write.max(1),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<B> {
        &self.store
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            resizes: self.counters.resizes.load(Ordering::Relaxed),
        }
    }

    pub async fn getattr(&self, node: NodeId) -> Result<Attrs> {
        self.store.getattr(node).await
    }

    /// Read `[offset, offset + len)` in pieces of at most `max_read`. A short
    /// piece ends the transfer; the result may be shorter than `len`.
    pub async fn read(&self, node: NodeId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let want = (len - out.len()).min(self.max_read);
            let at = offset + out.len() as u64;
            self.counters.reads.fetch_add(1, Ordering::Relaxed);
            let piece = self.store.read(node, at, want).await?;
            if piece.len() > want {
                return Err(CacheError::BackendUnavailable(format!(
                    "backend returned {} bytes for a {want} byte read",
                    piece.len()
                )));
            }
            let short = piece.len() < want;
            out.extend_from_slice(&piece);
            if short {
                trace!("node {node}: short read at {at}, {} of {want}", piece.len());
                break;
            }
        }
        Ok(out)
    }

    /// Write all of `data` at `offset` in pieces of at most `max_write`,
    /// in offset order. Any piece written short fails the whole call.
    pub async fn write(&self, node: NodeId, offset: u64, data: &[u8]) -> Result<()> {
        for (i, piece) in data.chunks(self.max_write).enumerate() {
            let at = offset + (i * self.max_write) as u64;
            self.counters.writes.fetch_add(1, Ordering::Relaxed);
            let written = self.store.write(node, at, piece).await?;
            if written != piece.len() {
                warn!(
                    "node {node}: short write at {at}, {written} of {}",
                    piece.len()
                );
                return Err(CacheError::ShortTransfer {
                    offset: at,
                    expected: piece.len(),
                    actual: written,
                });
            }
            self.counters
                .bytes_written
                .fetch_add(written as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    pub async fn set_size(&self, node: NodeId, size: u64) -> Result<Attrs> {
        self.counters.resizes.fetch_add(1, Ordering::Relaxed);
        self.store
            .set_size(node, size)
            .await
            .map_err(|e| CacheError::ResizeRejected {
                size,
                reason: e.to_string(),
            })
    }

    /// Close-time notifications. Failures are logged and swallowed.
    pub async fn close_notify(&self, node: NodeId) {
        if let Err(e) = self.store.flush(node).await {
            warn!("node {node}: flush notification failed: {e}");
        }
        if let Err(e) = self.store.release(node).await {
            warn!("node {node}: release notification failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{Fault, InMemoryBackend, Request};

    #[tokio::test]
    async fn test_write_split_by_max_write() {
        let store = Arc::new(InMemoryBackend::new());
        let client = BackendClient::new(store.clone(), 0x1000, 0x1000);
        client.write(1, 0x800, &vec![1u8; 0x2100]).await.unwrap();
        let writes: Vec<Request> = store.requests();
        assert_eq!(
            writes,
            vec![
                Request::Write {
                    node: 1,
                    offset: 0x800,
                    len: 0x1000
                },
                Request::Write {
                    node: 1,
                    offset: 0x1800,
                    len: 0x1000
                },
                Request::Write {
                    node: 1,
                    offset: 0x2800,
                    len: 0x100
                },
            ]
        );
        assert_eq!(client.stats().bytes_written, 0x2100);
    }

    #[tokio::test]
    async fn test_read_stops_at_short_piece() {
        let store = Arc::new(InMemoryBackend::new());
        store.insert(1, vec![4u8; 0x1800]);
        let client = BackendClient::new(store.clone(), 0x1000, 0x1000);
        let out = client.read(1, 0, 0x4000).await.unwrap();
        assert_eq!(out.len(), 0x1800);
        assert_eq!(store.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_short_write_is_an_error() {
        let store = Arc::new(InMemoryBackend::new());
        let client = BackendClient::new(store.clone(), 0x1000, 0x1000);
        store.fail_next_write(Fault::ShortWrite(10));
        let err = client.write(1, 0, &[0u8; 64]).await.unwrap_err();
        assert_eq!(
            err,
            CacheError::ShortTransfer {
                offset: 0,
                expected: 64,
                actual: 10
            }
        );
    }

    #[tokio::test]
    async fn test_set_size_failure_is_resize_rejected() {
        let store = Arc::new(InMemoryBackend::new());
        let client = BackendClient::new(store.clone(), 0x1000, 0x1000);
        store.fail_next_set_size();
        assert!(matches!(
            client.set_size(1, 10).await,
            Err(CacheError::ResizeRejected { size: 10, .. })
        ));
    }

    #[tokio::test]
    async fn test_close_notify_swallows_failures() {
        let store = Arc::new(InMemoryBackend::new());
        let client = BackendClient::new(store.clone(), 0x1000, 0x1000);
        store.fail_next_release();
        client.close_notify(5).await;
        assert_eq!(
            store.requests(),
            vec![Request::Flush { node: 5 }, Request::Release { node: 5 }]
        );
    }
}
