#[macro_use]
extern crate log;

pub mod backend;
pub mod block_table;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod file;
pub mod layout;
pub mod mmap;
pub mod policy;
pub mod replay;
mod resize;
pub mod stats;
pub mod worker;
mod writeback;

pub use backend::{Attrs, BackendStore, InMemoryBackend, LocalFsBackend, NodeId};
pub use cache::Cache;
pub use config::{CacheConfig, load_config};
pub use error::{CacheError, Result};
pub use file::{CachedFile, FileHandle};
pub use mmap::MappedView;
pub use policy::CacheMode;
pub use stats::CacheStats;
