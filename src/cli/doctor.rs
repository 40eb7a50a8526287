//! CLI `doctor` command: inspect the storage tree and the cache and print a
//! health report.

use anyhow::{Context, Result};

use trackstore::config::RecorderConfig;
use trackstore::db;
use trackstore::storage::log::LogStore;

/// Run storage and cache diagnostics and print a health report.
pub fn doctor(config: &RecorderConfig) -> Result<()> {
    let layout = super::layout(config);
    let root = layout.root();

    if !root.exists() {
        println!("Storage: not found at {}", root.display());
        println!("Run `trackstore serve` or `trackstore ingest` to initialize.");
        return Ok(());
    }

    let store = LogStore::new(layout.clone());
    let mut devices = 0usize;
    let mut partitions = 0usize;
    let mut log_bytes = 0u64;
    let users = store.list_users()?;
    for user in &users {
        for device in store.list_devices(user)? {
            devices += 1;
            for path in store.list_partitions(user, &device, None)? {
                partitions += 1;
                log_bytes += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            }
        }
    }

    let missing = std::fs::read_to_string(layout.missing_ghash())
        .map(|s| s.lines().count())
        .unwrap_or(0);

    println!("trackstore Health Report");
    println!("========================");
    println!();
    println!("Storage root:      {}", root.display());
    println!("Users:             {}", users.len());
    println!("Devices:           {devices}");
    println!("Log partitions:    {partitions} ({})", format_bytes(log_bytes));
    println!("Geocoder:          {}", config.geocode.provider);
    println!("Missing geohashes: {missing}");
    println!();

    let cache_path = layout.cache_db();
    if !cache_path.exists() {
        println!("Cache:             not found at {}", cache_path.display());
        return Ok(());
    }

    let file_size = std::fs::metadata(&cache_path).map(|m| m.len()).unwrap_or(0);
    let cache = super::open_cache(&layout).context("failed to open cache (may be corrupt)")?;
    let report = cache
        .with_connection(db::check_database_health)?
        .context("failed to run health check")?;

    println!("Cache:             {}", cache_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!();
    println!("Cache records:");
    if report.table_counts.is_empty() {
        println!("  (empty)");
    }
    for (table, count) in &report.table_counts {
        println!("  {:<17}{count}", format!("{table}:"));
    }
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Dump what is still readable: trackstore cache dump geocode > geocode.txt");
        println!("  2. Move {} aside and reload:", cache_path.display());
        println!("     trackstore cache load geocode geocode.txt");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
