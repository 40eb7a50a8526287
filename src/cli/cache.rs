//! CLI `cache` commands: dump and bulk-load cache tables.

use anyhow::Result;
use std::io::Write;
use std::path::Path;

use trackstore::cache::Table;
use trackstore::config::RecorderConfig;

/// Print every `key value` record of `table` to stdout.
pub fn dump(config: &RecorderConfig, table: Table) -> Result<()> {
    let cache = super::open_cache(&super::layout(config))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let n = cache.dump(table, &mut out)?;
    out.flush()?;
    tracing::info!(%table, records = n, "cache dumped");
    Ok(())
}

/// Load `key value` lines from `file` (or stdin) into `table`.
pub fn load(config: &RecorderConfig, table: Table, file: Option<&Path>) -> Result<()> {
    let input = super::read_input(file)?;
    let cache = super::open_cache(&super::layout(config))?;
    let n = cache.load(table, input.as_slice())?;
    println!("Loaded {n} records into {table}.");
    Ok(())
}
