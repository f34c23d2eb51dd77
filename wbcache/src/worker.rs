//! Flush worker pool.
//!
//! A fixed number of workers, each a tokio task draining its own FIFO queue.
//! Work is routed by a shard key (the node id), so everything submitted for
//! one file runs one job at a time in submission order. Results come back
//! through a per-job oneshot channel.
//!
//! ```text
//! caller                          worker[key % n]
//! ──────                          ───────────────
//!   submit(key, fut) ───────────────► queue
//!   ... returns immediately            run fut
//!   rx.await ◄───────────────────────  send result
//! ```

use std::future::Future;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{CacheError, Result};

type Job = BoxFuture<'static, ()>;

pub struct FlushPool {
    queues: Mutex<Option<Vec<mpsc::UnboundedSender<Job>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FlushPool {
    /// Spawn `workers` tasks on the current tokio runtime. Fails with
    /// [`CacheError::WorkerShutdown`] when called outside one.
    pub fn new(workers: usize) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            error!("cannot start flush workers: {e}");
            CacheError::WorkerShutdown
        })?;
        let mut queues = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers.max(1) {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            handles.push(runtime.spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                debug!("flush worker {id} stopped");
            }));
            queues.push(tx);
        }
        Ok(Self {
            queues: Mutex::new(Some(queues)),
            workers: Mutex::new(handles),
        })
    }

    /// Queue `fut` behind earlier work with the same `key`.
    pub fn submit<F, T>(&self, key: u64, fut: F) -> Result<oneshot::Receiver<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            // the receiver may be gone if the submitter stopped caring
            let _ = tx.send(fut.await);
        }
        .boxed();
        let queues = self.queues.lock().map_err(|_| CacheError::WorkerShutdown)?;
        let queue = queues
            .as_ref()
            .and_then(|q| q.get((key % q.len() as u64) as usize))
            .ok_or(CacheError::WorkerShutdown)?;
        queue.send(job).map_err(|_| CacheError::WorkerShutdown)?;
        Ok(rx)
    }

    pub fn is_running(&self) -> bool {
        self.queues.lock().map(|q| q.is_some()).unwrap_or(false)
    }

    /// Stop accepting work, let queued jobs finish and join every worker.
    pub async fn shutdown(&self) {
        let queues = match self.queues.lock() {
            Ok(mut q) => q.take(),
            Err(_) => None,
        };
        drop(queues);
        let handles = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!("flush worker exited abnormally: {e}");
            }
        }
    }
}
