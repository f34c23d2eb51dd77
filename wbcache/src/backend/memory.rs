//! In-memory backing store for tests and local development.
//!
//! Every request is recorded so callers can assert what the cache sent and
//! in what order. Faults can be queued per request kind.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Attrs, BackendStore, NodeId};
use crate::error::{CacheError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Getattr { node: NodeId },
    Read { node: NodeId, offset: u64, len: usize },
    Write { node: NodeId, offset: u64, len: usize },
    SetSize { node: NodeId, size: u64 },
    Flush { node: NodeId },
    Release { node: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail the request outright.
    Unavailable,
    /// Accept only this many bytes of the next write.
    ShortWrite(usize),
}

#[derive(Default)]
struct Inner {
    files: HashMap<NodeId, Vec<u8>>,
    log: Vec<Request>,
    write_faults: Vec<Fault>,
    resize_faults: usize,
    read_faults: usize,
    release_faults: usize,
}

#[derive(Default)]
pub struct InMemoryBackend {
    inner: Mutex<Inner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a node with contents.
    pub fn insert(&self, node: NodeId, data: Vec<u8>) {
        self.lock().files.insert(node, data);
    }

    pub fn contents(&self, node: NodeId) -> Vec<u8> {
        self.lock().files.get(&node).cloned().unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.lock().log.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().log.clear();
    }

    pub fn fail_next_write(&self, fault: Fault) {
        self.lock().write_faults.push(fault);
    }

    pub fn fail_next_set_size(&self) {
        self.lock().resize_faults += 1;
    }

    pub fn fail_next_read(&self) {
        self.lock().read_faults += 1;
    }

    pub fn fail_next_release(&self) {
        self.lock().release_faults += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned log is still a usable log.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BackendStore for InMemoryBackend {
    async fn getattr(&self, node: NodeId) -> Result<Attrs> {
        let mut inner = self.lock();
        inner.log.push(Request::Getattr { node });
        let size = inner.files.entry(node).or_default().len() as u64;
        Ok(Attrs {
            ino: node,
            size,
            mode: 0o100644,
        })
    }

    async fn read(&self, node: NodeId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.lock();
        inner.log.push(Request::Read { node, offset, len });
        if inner.read_faults > 0 {
            inner.read_faults -= 1;
            return Err(CacheError::BackendUnavailable("injected read fault".into()));
        }
        let data = inner.files.get(&node).map(Vec::as_slice).unwrap_or(&[]);
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        Ok(data[start..end].to_vec())
    }

    async fn write(&self, node: NodeId, offset: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.lock();
        inner.log.push(Request::Write {
            node,
            offset,
            len: data.len(),
        });
        let accepted = match inner.write_faults.pop() {
            Some(Fault::Unavailable) => {
                return Err(CacheError::BackendUnavailable("injected write fault".into()));
            }
            Some(Fault::ShortWrite(n)) => n.min(data.len()),
            None => data.len(),
        };
        let file = inner.files.entry(node).or_default();
        let start = offset as usize;
        let end = start + accepted;
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    async fn set_size(&self, node: NodeId, size: u64) -> Result<Attrs> {
        let mut inner = self.lock();
        inner.log.push(Request::SetSize { node, size });
        if inner.resize_faults > 0 {
            inner.resize_faults -= 1;
            return Err(CacheError::BackendUnavailable("injected setattr fault".into()));
        }
        inner.files.entry(node).or_default().resize(size as usize, 0);
        Ok(Attrs {
            ino: node,
            size,
            mode: 0o100644,
        })
    }

    async fn flush(&self, node: NodeId) -> Result<()> {
        self.lock().log.push(Request::Flush { node });
        Ok(())
    }

    async fn release(&self, node: NodeId) -> Result<()> {
        let mut inner = self.lock();
        inner.log.push(Request::Release { node });
        if inner.release_faults > 0 {
            inner.release_faults -= 1;
            return Err(CacheError::BackendUnavailable("injected release fault".into()));
        }
        Ok(())
    }
}
