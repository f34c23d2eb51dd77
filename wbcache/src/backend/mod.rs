//! Backing store adapter.
//!
//! Submodules:
//! - `client`: request wrapper used by the cache (transfer limits, short
//!   transfer checks, counters)
//! - `memory`: in-memory store with a request log and fault injection
//! - `localfs`: one backing file per node under a local directory
use async_trait::async_trait;

use crate::error::Result;

pub mod client;
pub mod localfs;
pub mod memory;

pub use client::{BackendClient, BackendStats};
pub use localfs::LocalFsBackend;
pub use memory::{InMemoryBackend, Request};

/// Identifier of a file on the backing store.
pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attrs {
    pub ino: NodeId,
    pub size: u64,
    pub mode: u32,
}

/// Request/response interface of the authoritative store.
///
/// Requests for one node arrive in program order; implementations need not
/// reorder-protect anything themselves.
#[async_trait]
pub trait BackendStore: Send + Sync {
    async fn getattr(&self, node: NodeId) -> Result<Attrs>;

    /// Read up to `len` bytes at `offset`. May return fewer at end of data,
    /// never more.
    async fn read(&self, node: NodeId, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Returns the number of bytes written.
    async fn write(&self, node: NodeId, offset: u64, data: &[u8]) -> Result<usize>;

    /// Authoritative resize.
    async fn set_size(&self, node: NodeId, size: u64) -> Result<Attrs>;

    async fn flush(&self, node: NodeId) -> Result<()>;

    async fn release(&self, node: NodeId) -> Result<()>;
}
