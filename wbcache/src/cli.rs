use clap::{Parser, Subcommand};
use std::path::PathBuf;

use wbcache::CacheMode;

#[derive(Parser)]
#[command(name = "wbcache", version, about = "Write-back cache test driver")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay the built-in fsx scenarios against a directory-backed store
    Replay {
        /// Directory holding one backing file per node
        #[arg(short, long)]
        dir: PathBuf,

        /// YAML cache config; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run only this cache mode instead of all four
        #[arg(short, long)]
        mode: Option<CacheMode>,

        #[arg(long, default_value_t = 839)]
        seed: u64,

        /// Split every read into this many concurrent requests
        #[arg(long, default_value_t = 1)]
        read_tasks: usize,
    },
}
