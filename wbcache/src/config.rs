use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::policy::CacheMode;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache granularity in bytes; a power of two.
    pub block_size: u64,
    /// Mapped views are aligned down to this.
    pub page_size: u64,
    /// Largest single read request sent to the backend.
    pub max_read: usize,
    /// Largest single write request sent to the backend.
    pub max_write: usize,
    /// Buffers allowed across all open files.
    pub max_buffers: usize,
    pub flush_workers: usize,
    pub default_mode: CacheMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 0x10000,
            page_size: 4096,
            max_read: 0x20000,
            max_write: 0x20000,
            max_buffers: 1024,
            flush_workers: 4,
            default_mode: CacheMode::Writeback,
        }
    }
}

impl CacheConfig {
    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_max_write(mut self, max_write: usize) -> Self {
        self.max_write = max_write;
        self
    }

    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            bail!("block_size {} must be a power of two", self.block_size);
        }
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            bail!("page_size {} must be a power of two", self.page_size);
        }
        if self.block_size % self.page_size != 0 {
            bail!(
                "block_size {} must be a multiple of page_size {}",
                self.block_size,
                self.page_size
            );
        }
        if self.max_read == 0 || self.max_write == 0 {
            bail!("max_read and max_write must be non-zero");
        }
        if self.max_buffers == 0 {
            bail!("max_buffers must be non-zero");
        }
        if self.flush_workers == 0 {
            bail!("flush_workers must be non-zero");
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<CacheConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: CacheConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()
        .with_context(|| format!("Invalid cache config in {path}"))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "block_size: 4096\ndefault_mode: writeback_async").unwrap();
        let cfg = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.block_size, 4096);
        assert_eq!(cfg.default_mode, CacheMode::WritebackAsync);
        assert_eq!(cfg.max_write, CacheConfig::default().max_write);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let cfg = CacheConfig {
            block_size: 3000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = CacheConfig {
            block_size: 1024,
            page_size: 4096,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert!(CacheConfig::default().with_max_write(0).validate().is_err());
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = load_config("/nonexistent/wbcache.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
