pub mod cache;
pub mod doctor;
pub mod ingest;
pub mod query;

use anyhow::{Context, Result};
use std::path::Path;

use trackstore::cache::Cache;
use trackstore::config::RecorderConfig;
use trackstore::storage::StorageLayout;

/// Storage layout rooted at the configured directory.
fn layout(config: &RecorderConfig) -> StorageLayout {
    StorageLayout::new(config.resolved_storage_dir())
}

/// Open the cache of `layout`, creating it if needed.
fn open_cache(layout: &StorageLayout) -> Result<Cache> {
    let path = layout.cache_db();
    Cache::open(&path).with_context(|| format!("cannot open cache at {}", path.display()))
}

/// Read `path`, or stdin when it is `None` or `-`.
fn read_input(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(p) if p != Path::new("-") => {
            std::fs::read(p).with_context(|| format!("failed to read {}", p.display()))
        }
        _ => {
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut std::io::stdin(), &mut buf).context("failed to read stdin")?;
            Ok(buf)
        }
    }
}
