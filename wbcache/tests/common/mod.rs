use std::sync::{Arc, Once};

use wbcache::{Cache, CacheConfig, CacheMode, InMemoryBackend};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// 4 KiB blocks and pages keep the interesting cases small.
pub fn small_config(mode: CacheMode) -> CacheConfig {
    CacheConfig {
        block_size: 0x1000,
        page_size: 0x1000,
        ..Default::default()
    }
    .with_mode(mode)
}

pub fn memory_cache(config: CacheConfig) -> (Arc<InMemoryBackend>, Cache<InMemoryBackend>) {
    init_logging();
    let store = Arc::new(InMemoryBackend::new());
    let cache = Cache::new(store.clone(), config).expect("valid config");
    (store, cache)
}

/// Bytes whose value encodes their block, so misplaced data is obvious.
pub fn block_pattern(len: usize, block_size: usize) -> Vec<u8> {
    (0..len).map(|i| (i / block_size) as u8 + 1).collect()
}
