//! CLI query commands: `list`, `locations`, `last` and `kill`.

use anyhow::{Context, Result};
use std::io::Write;

use trackstore::config::RecorderConfig;
use trackstore::storage::log::LogStore;
use trackstore::storage::output::{parse_fields, write_locations, LocationQuery, OutputFormat};
use trackstore::storage::query::{make_window, Scanner};
use trackstore::storage::snapshot::SnapshotStore;

/// Print the users, or the devices of `user`, one per line.
pub fn list(config: &RecorderConfig, user: Option<&str>) -> Result<()> {
    let store = LogStore::new(super::layout(config));
    let names = match user {
        Some(u) => store.list_devices(u)?,
        None => store.list_users()?,
    };
    for name in names {
        println!("{name}");
    }
    Ok(())
}

/// Arguments of the `locations` command as typed on the command line.
#[derive(Debug, Clone, Default)]
pub struct LocationArgs {
    pub user: String,
    pub device: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<usize>,
    pub format: String,
    pub fields: Option<String>,
}

impl LocationArgs {
    pub fn to_query(&self, now: i64) -> Result<LocationQuery> {
        let format: OutputFormat = self.format.parse().map_err(anyhow::Error::msg)?;
        let window = make_window(self.from.as_deref(), self.to.as_deref(), now)?;
        Ok(LocationQuery {
            user: self.user.clone(),
            device: self.device.clone(),
            window,
            limit: self.limit,
            format,
            fields: self.fields.as_deref().map(parse_fields),
        })
    }
}

/// Print the history of one device in the requested format.
pub fn locations(config: &RecorderConfig, args: &LocationArgs) -> Result<()> {
    let query = args.to_query(chrono::Utc::now().timestamp())?;
    let layout = super::layout(config);
    let cache = super::open_cache(&layout)?;
    let store = LogStore::new(layout);
    let scanner = Scanner::new(&store, Some(&cache), config.geocode.precision);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let n = write_locations(&scanner, &query, &mut out)?;
    out.flush()?;
    tracing::debug!(user = %query.user, device = %query.device, n, "locations written");
    Ok(())
}

/// Print the latest snapshots as a JSON array.
pub fn last(config: &RecorderConfig, user: Option<&str>, device: Option<&str>, fields: Option<&str>) -> Result<()> {
    let layout = super::layout(config);
    let cache = super::open_cache(&layout)?;
    let fields = fields.map(parse_fields);
    let snapshots = SnapshotStore::new(layout).last(Some(&cache), user, device, fields.as_deref())?;
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}

/// Remove the log partitions and the snapshot of one device.
pub fn kill(config: &RecorderConfig, user: &str, device: &str) -> Result<()> {
    let layout = super::layout(config);
    let removed = LogStore::new(layout.clone())
        .kill(user, device)
        .with_context(|| format!("failed to remove log of {user}/{device}"))?;
    let snapshot = SnapshotStore::new(layout).remove(user, device)?;

    if removed.is_empty() && !snapshot {
        println!("Nothing stored for {user}/{device}.");
        return Ok(());
    }
    for name in &removed {
        println!("removed {name}");
    }
    if snapshot {
        println!("removed last position");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_args_validate() {
        let args = LocationArgs {
            user: "jane".into(),
            device: "phone".into(),
            format: "gpx".into(),
            limit: Some(5),
            ..Default::default()
        };
        let q = args.to_query(1_700_000_000).unwrap();
        assert_eq!(q.format, OutputFormat::Gpx);
        assert_eq!(q.limit, Some(5));

        let bad = LocationArgs {
            format: "yaml".into(),
            ..args.clone()
        };
        assert!(bad.to_query(0).is_err());
    }
}
