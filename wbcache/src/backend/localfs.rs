//! Local directory backend: node `n` is stored as the file `<root>/<n>`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{Attrs, BackendStore, NodeId};
use crate::error::Result;

pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, node: NodeId) -> PathBuf {
        self.root.join(node.to_string())
    }

    async fn open(&self, node: NodeId) -> Result<fs::File> {
        fs::create_dir_all(&self.root).await?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.path_for(node))
            .await?;
        Ok(file)
    }
}

#[async_trait]
impl BackendStore for LocalFsBackend {
    async fn getattr(&self, node: NodeId) -> Result<Attrs> {
        let file = self.open(node).await?;
        let meta = file.metadata().await?;
        Ok(Attrs {
            ino: node,
            size: meta.len(),
            mode: 0o100644,
        })
    }

    async fn read(&self, node: NodeId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = self.open(node).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::with_capacity(len);
        // read_to_end on a bounded reader stops at EOF, giving a short read
        file.take(len as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn write(&self, node: NodeId, offset: u64, data: &[u8]) -> Result<usize> {
        let mut file = self.open(node).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len())
    }

    async fn set_size(&self, node: NodeId, size: u64) -> Result<Attrs> {
        let file = self.open(node).await?;
        file.set_len(size).await?;
        Ok(Attrs {
            ino: node,
            size,
            mode: 0o100644,
        })
    }

    async fn flush(&self, node: NodeId) -> Result<()> {
        let file = self.open(node).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn release(&self, _node: NodeId) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_localfs_write_read_resize() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalFsBackend::new(tmp.path());

        assert_eq!(store.getattr(9).await.unwrap().size, 0);
        store.write(9, 10, &[3u8; 20]).await.unwrap();
        assert_eq!(store.getattr(9).await.unwrap().size, 30);

        let out = store.read(9, 0, 64).await.unwrap();
        assert_eq!(out.len(), 30);
        assert!(out[..10].iter().all(|&b| b == 0));
        assert!(out[10..].iter().all(|&b| b == 3));

        store.set_size(9, 15).await.unwrap();
        assert_eq!(store.read(9, 0, 64).await.unwrap().len(), 15);
    }
}
