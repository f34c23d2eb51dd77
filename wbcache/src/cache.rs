//! Cache front end: open-file table, shared resources and lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex;

use crate::backend::{BackendClient, BackendStore, NodeId};
use crate::block_table::BufferBudget;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::file::{CachedFile, FileHandle, Peers};
use crate::layout::BlockLayout;
use crate::policy::CacheMode;
use crate::stats::{CacheStats, EngineCounters};
use crate::worker::FlushPool;

pub struct Cache<B: BackendStore + 'static> {
    config: CacheConfig,
    layout: BlockLayout,
    client: Arc<BackendClient<B>>,
    pool: Arc<FlushPool>,
    budget: Arc<BufferBudget>,
    counters: Arc<EngineCounters>,
    files: Mutex<HashMap<NodeId, FileHandle<B>>>,
    /// Eviction view of `files`, readable while a file's state is locked.
    peers: Arc<Peers<B>>,
}

impl<B: BackendStore + 'static> Cache<B> {
    /// Build a cache over `store`. The flush workers are spawned here, so
    /// this fails with [`CacheError::WorkerShutdown`] outside a tokio
    /// runtime.
    pub fn new(store: Arc<B>, config: CacheConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CacheError::InvalidConfig(e.to_string()))?;
        let client = Arc::new(BackendClient::new(
            store,
            config.max_read,
            config.max_write,
        ));
        Ok(Self {
            layout: BlockLayout::new(config.block_size),
            pool: Arc::new(FlushPool::new(config.flush_workers)?),
            budget: Arc::new(BufferBudget::new(config.max_buffers)),
            counters: Arc::new(EngineCounters::default()),
            files: Mutex::new(HashMap::new()),
            peers: Arc::new(std::sync::Mutex::new(HashMap::new())),
            client,
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The backing store, bypassing the cache.
    pub fn store(&self) -> &Arc<B> {
        self.client.store()
    }

    /// Open `node` in the configured default mode.
    pub async fn open(&self, node: NodeId) -> Result<FileHandle<B>> {
        self.open_with_mode(node, self.config.default_mode).await
    }

    /// Open `node`. A node that is already open returns the existing file
    /// (keeping its mode) with one more open reference.
    pub async fn open_with_mode(&self, node: NodeId, mode: CacheMode) -> Result<FileHandle<B>> {
        let mut files = self.files.lock().await;
        if let Some(file) = files.get(&node) {
            let mut st = file.state.write().await;
            st.opens += 1;
            if file.mode != mode {
                debug!(
                    "node {node}: already open as {}, ignoring {mode}",
                    file.mode
                );
            }
            return Ok(file.clone());
        }

        let attrs = self.client.getattr(node).await?;
        let file = Arc::new(CachedFile::new(
            node,
            mode,
            attrs.size,
            self.layout,
            self.config.page_size,
            self.client.clone(),
            self.pool.clone(),
            self.counters.clone(),
            self.budget.clone(),
            self.peers.clone(),
        ));
        debug!("node {node}: opened as {mode}, size {:#x}", attrs.size);
        self.lock_peers().insert(node, Arc::downgrade(&file));
        files.insert(node, file.clone());
        Ok(file)
    }

    /// Drop one open reference. Every close flushes; the last one also
    /// waits for queued flushes, notifies the backend and frees the buffers.
    /// Flush errors are returned even though teardown still happens.
    pub async fn close(&self, file: &FileHandle<B>) -> Result<()> {
        let mut files = self.files.lock().await;
        let (result, last) = file.close().await;
        if last {
            files.remove(&file.node);
            self.lock_peers().remove(&file.node);
        }
        result
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, Weak<CachedFile<B>>>> {
        match self.peers.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.counters
            .snapshot(self.client.stats(), self.budget.in_use())
    }

    /// Buffers held across every open file.
    pub fn buffers_in_use(&self) -> usize {
        self.budget.in_use()
    }

    pub async fn open_files(&self) -> usize {
        self.files.lock().await.len()
    }

    /// Close every open file regardless of its open count, then stop the
    /// flush workers. Returns the first close error.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<FileHandle<B>> = {
            let mut files = self.files.lock().await;
            files.drain().map(|(_, f)| f).collect()
        };
        self.lock_peers().clear();
        let mut first_err = None;
        for file in drained {
            file.state.write().await.opens = 1;
            let (result, _) = file.close().await;
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        self.pool.shutdown().await;
        info!("cache shut down");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, Request};

    #[tokio::test]
    async fn test_reopen_shares_file_and_last_close_tears_down() {
        let store = Arc::new(InMemoryBackend::new());
        let cache = Cache::new(store.clone(), CacheConfig::default()).unwrap();

        let a = cache.open(3).await.unwrap();
        let b = cache.open(3).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        a.write(0, b"hello").await.unwrap();

        cache.close(&a).await.unwrap();
        assert_eq!(cache.open_files().await, 1);
        assert_eq!(b.read(0, 5).await.unwrap(), b"hello");

        cache.close(&b).await.unwrap();
        assert_eq!(cache.open_files().await, 0);
        assert_eq!(cache.buffers_in_use(), 0);
        assert_eq!(b.read(0, 5).await.unwrap_err(), CacheError::NotOpen(3));
        assert_eq!(cache.close(&b).await.unwrap_err(), CacheError::NotOpen(3));

        let log = store.requests();
        assert_eq!(
            &log[log.len() - 2..],
            &[Request::Flush { node: 3 }, Request::Release { node: 3 }]
        );
        assert_eq!(
            log.iter()
                .filter(|r| matches!(r, Request::Getattr { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_open_seeds_size_from_backend() {
        let store = Arc::new(InMemoryBackend::new());
        store.insert(4, vec![2u8; 1234]);
        let cache = Cache::new(store, CacheConfig::default()).unwrap();
        let file = cache.open(4).await.unwrap();
        assert_eq!(file.size().await, 1234);
        assert_eq!(file.read(1000, 1000).await.unwrap(), vec![2u8; 234]);
        cache.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let store = Arc::new(InMemoryBackend::new());
        let cfg = CacheConfig {
            block_size: 100,
            ..Default::default()
        };
        assert!(matches!(
            Cache::new(store, cfg),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_new_outside_runtime_is_an_error() {
        let store = Arc::new(InMemoryBackend::new());
        assert!(matches!(
            Cache::new(store, CacheConfig::default()),
            Err(CacheError::WorkerShutdown)
        ));
    }
}
