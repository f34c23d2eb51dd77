mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use log::{error, info};
use wbcache::replay::run_all;
use wbcache::{Cache, CacheConfig, CacheMode, LocalFsBackend, load_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Replay {
            dir,
            config,
            mode,
            seed,
            read_tasks,
        } => {
            let cfg = match config {
                Some(path) => {
                    let path = path.to_str().context("config path is not valid UTF-8")?;
                    load_config(path)?
                }
                None => CacheConfig::default(),
            };
            let modes: Vec<CacheMode> = match mode {
                Some(m) => vec![*m],
                None => CacheMode::ALL.to_vec(),
            };
            let store = Arc::new(LocalFsBackend::new(dir));

            for (i, mode) in modes.into_iter().enumerate() {
                let cache = Cache::new(store.clone(), cfg.clone().with_mode(mode))?;
                let first_node = (i as u64 + 1) * 100;
                let result = run_all(&cache, mode, first_node, *seed, *read_tasks).await;
                cache.shutdown().await?;
                match result {
                    Ok(ran) => info!("{mode}: {} scenarios passed", ran.len()),
                    Err(e) => {
                        error!("{mode}: {e:?}");
                        return Err(e).context(format!("replay failed in {mode} mode"));
                    }
                }
            }
        }
    }

    Ok(())
}
