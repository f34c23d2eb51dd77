//! fsx-style operation replay.
//!
//! Each scenario is a short sequence of reads, writes, truncates and mapped
//! accesses that once exposed a coherence bug in a write-back cache. The
//! runner applies it to a cached file and to a plain in-memory model, checks
//! every read against the model, and finally compares the backend's bytes
//! with the model after the file is closed.

use anyhow::{Context, Result, bail, ensure};
use futures::future::try_join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::{BackendStore, NodeId};
use crate::cache::Cache;
use crate::file::FileHandle;
use crate::policy::CacheMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Write { offset: u64, len: usize },
    Read { offset: u64, len: usize },
    Truncate { size: u64 },
    /// Store through a writable mapping. Extends the file first if the
    /// range reaches past end of file, as a mapping never does that itself.
    MapWrite { offset: u64, len: usize },
    MapRead { offset: u64, len: usize },
    /// Close the file and open it again.
    CloseOpen,
}

impl Op {
    fn uses_mmap(&self) -> bool {
        matches!(self, Op::MapWrite { .. } | Op::MapRead { .. })
    }
}

#[derive(Debug)]
pub struct Scenario {
    pub name: &'static str,
    pub ops: &'static [Op],
}

impl Scenario {
    /// Mapped access needs buffering, so these are skipped for uncached files.
    pub fn needs_mmap(&self) -> bool {
        self.ops.iter().any(Op::uses_mmap)
    }
}

use Op::*;

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "extend_from_dirty_page",
        ops: &[
            Write {
                offset: 0x21a0,
                len: 0xf0a8,
            },
            Truncate { size: 0x28702 },
            Read {
                offset: 0xb284,
                len: 0x9b22,
            },
        ],
    },
    Scenario {
        name: "extend_by_mapwrite",
        ops: &[
            MapWrite {
                offset: 0x29a3a,
                len: 0x849e,
            },
            MapWrite {
                offset: 0x3c7d8,
                len: 0x3994,
            },
            Read {
                offset: 0x30c16,
                len: 0xf556,
            },
        ],
    },
    Scenario {
        name: "last_page",
        ops: &[
            Write {
                offset: 0x1134f,
                len: 0xcc77,
            },
            Write {
                offset: 0x2096a,
                len: 0xdfa7,
            },
            Read {
                offset: 0x1a3aa,
                len: 0xb5b7,
            },
        ],
    },
    Scenario {
        name: "mapread_hole",
        ops: &[
            Write {
                offset: 0xf205,
                len: 0x123b7,
            },
            MapRead {
                offset: 0x2f4c,
                len: 0xeeea,
            },
        ],
    },
    Scenario {
        name: "read_hole_from_cached_block",
        ops: &[
            Write {
                offset: 0x160c5,
                len: 0xa996,
            },
            Read {
                offset: 0x472e,
                len: 0xd8d5,
            },
        ],
    },
    Scenario {
        name: "truncate_into_dirty_buffer",
        ops: &[
            Write {
                offset: 0x3bad7,
                len: 0x4529,
            },
            Write {
                offset: 0xc30d,
                len: 0x5f77,
            },
            Truncate { size: 0x10916 },
            Read {
                offset: 0xdf17,
                len: 0x29ff,
            },
            Truncate { size: 0x152b4 },
        ],
    },
    Scenario {
        name: "truncate_into_dirty_buffer2",
        ops: &[
            Truncate { size: 0x344f3 },
            Write {
                offset: 0x2790c,
                len: 0xd86a,
            },
            Truncate { size: 0x2de38 },
            Read {
                offset: 0x1fd7a,
                len: 0xc594,
            },
            Truncate { size: 0x31e71 },
        ],
    },
    Scenario {
        name: "resize_a_valid_buffer_while_extending",
        ops: &[
            Write {
                offset: 0x36ee6,
                len: 0x14530,
            },
            Write {
                offset: 0x33256,
                len: 0x1507c,
            },
            Write {
                offset: 0x4c03d,
                len: 0x175c,
            },
            Read {
                offset: 0x3599c,
                len: 0xe277,
            },
        ],
    },
    Scenario {
        name: "reopen_between_writes",
        ops: &[
            Write {
                offset: 0x8000,
                len: 0x12000,
            },
            CloseOpen,
            Write {
                offset: 0x3000,
                len: 0x7000,
            },
            Truncate { size: 0x15000 },
            CloseOpen,
            Read {
                offset: 0,
                len: 0x15000,
            },
        ],
    },
];

/// Reference model: what an unbuffered store holds after the same ops.
#[derive(Debug, Default)]
struct Model {
    data: Vec<u8>,
}

impl Model {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn write(&mut self, offset: u64, src: &[u8]) {
        let start = offset as usize;
        let end = start + src.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(src);
    }

    fn truncate(&mut self, size: u64) {
        self.data.resize(size as usize, 0);
    }

    /// Bytes at `[offset, offset + len)`, stopping at end of file.
    fn read(&self, offset: u64, len: usize) -> &[u8] {
        let start = (offset as usize).min(self.data.len());
        let end = (start + len).min(self.data.len());
        &self.data[start..end]
    }
}

/// Replays one scenario on `node`, which is truncated to empty first.
pub struct Runner<'a, B: BackendStore + 'static> {
    cache: &'a Cache<B>,
    node: NodeId,
    mode: CacheMode,
    rng: StdRng,
    read_tasks: usize,
}

impl<'a, B: BackendStore + 'static> Runner<'a, B> {
    pub fn new(cache: &'a Cache<B>, node: NodeId, mode: CacheMode, seed: u64) -> Self {
        Self {
            cache,
            node,
            mode,
            rng: StdRng::seed_from_u64(seed),
            read_tasks: 1,
        }
    }

    /// Issue each read as `n` concurrent requests over consecutive slices
    /// of the range, the way a kernel with async reads does.
    pub fn with_read_tasks(mut self, n: usize) -> Self {
        self.read_tasks = n.max(1);
        self
    }

    fn payload(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.rng.fill(&mut buf[..]);
        buf
    }

    pub async fn run(&mut self, scenario: &Scenario) -> Result<()> {
        let mut file = self.cache.open_with_mode(self.node, self.mode).await?;
        file.set_size(0).await?;
        let mut model = Model::default();

        for (step, op) in scenario.ops.iter().enumerate() {
            trace!("{}: step {step}: {op:?}", scenario.name);
            self.apply(&mut file, &mut model, op)
                .await
                .with_context(|| format!("{} step {step} ({op:?})", scenario.name))?;
        }

        self.cache.close(&file).await?;
        self.verify_backend(&model)
            .await
            .with_context(|| format!("{}: backend contents after close", scenario.name))
    }

    async fn apply(&mut self, file: &mut FileHandle<B>, model: &mut Model, op: &Op) -> Result<()> {
        match *op {
            Write { offset, len } => {
                let data = self.payload(len);
                let n = file.write(offset, &data).await?;
                ensure!(n == len, "short write: {n} of {len}");
                model.write(offset, &data);
            }
            Read { offset, len } => {
                let got = self.read(file, offset, len).await?;
                compare(offset, &got, model.read(offset, len))?;
            }
            Truncate { size } => {
                file.set_size(size).await?;
                model.truncate(size);
            }
            MapWrite { offset, len } => {
                let data = self.payload(len);
                let end = offset + len as u64;
                if end > model.size() {
                    file.set_size(end).await?;
                    model.truncate(end);
                }
                let view = file.map(offset, len, true).await?;
                view.write((offset - view.file_offset()) as usize, &data)
                    .await?;
                view.unmap().await?;
                model.write(offset, &data);
            }
            MapRead { offset, len } => {
                let view = file.map(offset, len, false).await?;
                let got = view
                    .read((offset - view.file_offset()) as usize, len)
                    .await?;
                view.unmap().await?;
                let mut want = model.read(offset, len).to_vec();
                want.resize(len, 0);
                compare(offset, &got, &want)?;
            }
            CloseOpen => {
                self.cache.close(file).await?;
                *file = self.cache.open_with_mode(self.node, self.mode).await?;
            }
        }
        Ok(())
    }

    async fn read(&self, file: &FileHandle<B>, offset: u64, len: usize) -> Result<Vec<u8>> {
        if self.read_tasks == 1 {
            return Ok(file.read(offset, len).await?);
        }
        let slice = len.div_ceil(self.read_tasks).max(1);
        let reads = (0..len).step_by(slice).map(move |start| {
            let n = slice.min(len - start);
            file.read(offset + start as u64, n)
        });
        // slices past end of file come back short or empty
        Ok(try_join_all(reads).await?.concat())
    }

    async fn verify_backend(&self, model: &Model) -> Result<()> {
        let size = self.cache.store().getattr(self.node).await?.size;
        let raw = self
            .cache
            .open_with_mode(self.node, CacheMode::Uncached)
            .await?;
        let got = raw.read(0, size as usize).await?;
        self.cache.close(&raw).await?;
        ensure!(
            size == model.size(),
            "backend size {size:#x}, expected {:#x}",
            model.size()
        );
        compare(0, &got, &model.data)
    }
}

fn compare(offset: u64, got: &[u8], want: &[u8]) -> Result<()> {
    if got.len() != want.len() {
        bail!(
            "read at {offset:#x} returned {:#x} bytes, expected {:#x}",
            got.len(),
            want.len()
        );
    }
    if let Some(i) = got.iter().zip(want).position(|(a, b)| a != b) {
        bail!(
            "mismatch at {:#x}: got {:#04x}, expected {:#04x}",
            offset + i as u64,
            got[i],
            want[i]
        );
    }
    Ok(())
}

/// Replay every scenario that applies to `mode`, each on its own node
/// starting at `first_node`, splitting reads over `read_tasks` concurrent
/// requests. Returns the names that were run.
pub async fn run_all<B: BackendStore + 'static>(
    cache: &Cache<B>,
    mode: CacheMode,
    first_node: NodeId,
    seed: u64,
    read_tasks: usize,
) -> Result<Vec<&'static str>> {
    let mut ran = Vec::new();
    for (i, scenario) in SCENARIOS.iter().enumerate() {
        if scenario.needs_mmap() && !mode.is_buffered() {
            debug!("skipping {} for {mode}", scenario.name);
            continue;
        }
        let node = first_node + i as u64;
        Runner::new(cache, node, mode, seed.wrapping_add(i as u64))
            .with_read_tasks(read_tasks)
            .run(scenario)
            .await?;
        info!("{}: ok ({mode})", scenario.name);
        ran.push(scenario.name);
    }
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_write_and_truncate() {
        let mut model = Model::default();
        model.write(4, &[1, 2]);
        assert_eq!(model.data, vec![0, 0, 0, 0, 1, 2]);
        model.truncate(5);
        assert_eq!(model.read(3, 10), &[0, 1]);
        model.truncate(7);
        assert_eq!(model.read(0, 10), &[0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn test_compare_reports_first_difference() {
        assert!(compare(0, &[1, 2, 3], &[1, 2, 3]).is_ok());
        let err = compare(0x10, &[1, 2, 3], &[1, 9, 3]).unwrap_err();
        assert!(err.to_string().contains("0x11"));
        assert!(compare(0, &[1], &[1, 2]).is_err());
    }

    #[test]
    fn test_mmap_scenarios_are_flagged() {
        let names: Vec<&str> = SCENARIOS
            .iter()
            .filter(|s| s.needs_mmap())
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["extend_by_mapwrite", "mapread_hole"]);
    }
}
