//! Transactional key-value cache.
//!
//! Wraps one SQLite environment holding several named tables (see [`Table`]).
//! Every `get`/`put`/`delete` runs in its own transaction; writers are
//! serialized through the connection mutex and WAL gives readers a consistent
//! snapshot. [`Cache::scan_prefix`] is the scan-and-rewrite primitive the
//! geocode memoization and geofence state build on.
//!
//! The cache is an optimization layer: the plain accessors log failures and
//! behave as a miss or a no-op, while the `try_*` variants surface them.

pub mod geocode;
pub mod keys;

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RecorderError, Result};

/// Named tables inside the cache environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Reverse-geocode results keyed by geohash.
    Geocode,
    /// Geofences keyed by [`keys::WaypointKey`].
    Waypoints,
    /// Tracker-id overrides keyed by full topic.
    TopicToTid,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Geocode, Table::Waypoints, Table::TopicToTid];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Geocode => "geocode",
            Self::Waypoints => "waypoints",
            Self::TopicToTid => "topic2tid",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "geocode" | "ghash" => Ok(Self::Geocode),
            "waypoints" | "wp" => Ok(Self::Waypoints),
            "topic2tid" => Ok(Self::TopicToTid),
            _ => Err(format!("unknown cache table: {s}")),
        }
    }
}

pub struct Cache {
    conn: Mutex<Connection>,
}

impl Cache {
    /// Open the cache at `path`. Failure here is fatal for the process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = crate::db::open_database(path.as_ref())
            .map_err(|e| RecorderError::ConfigurationFatal(format!("{e:#}")))?;
        Ok(Self::from_connection(conn))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = crate::db::open_memory_database()
            .map_err(|e| RecorderError::ConfigurationFatal(format!("{e:#}")))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RecorderError::CacheUnavailable(format!("cache lock poisoned: {e}")))
    }

    /// Run `f` with the underlying connection (diagnostics only).
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> T) -> Result<T> {
        let conn = self.lock()?;
        Ok(f(&conn))
    }

    pub fn try_get(&self, table: Table, key: &str) -> Result<Option<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = tx
            .query_row(
                "SELECT value FROM kv WHERE tbl = ?1 AND key = ?2",
                params![table.as_str(), key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        tx.commit()?;
        Ok(value)
    }

    pub fn try_put(&self, table: Table, key: &str, value: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO kv (tbl, key, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(tbl, key) DO UPDATE SET value = excluded.value",
            params![table.as_str(), key, value],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Returns `true` if a record was removed.
    pub fn try_delete(&self, table: Table, key: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let rows = tx.execute(
            "DELETE FROM kv WHERE tbl = ?1 AND key = ?2",
            params![table.as_str(), key],
        )?;
        tx.commit()?;
        Ok(rows > 0)
    }

    pub fn get(&self, table: Table, key: &str) -> Option<String> {
        self.try_get(table, key).unwrap_or_else(|e| {
            tracing::warn!(%table, key, error = %e, "cache get failed");
            None
        })
    }

    pub fn put(&self, table: Table, key: &str, value: &str) {
        if let Err(e) = self.try_put(table, key, value) {
            tracing::warn!(%table, key, error = %e, "cache put failed");
        }
    }

    pub fn delete(&self, table: Table, key: &str) {
        if let Err(e) = self.try_delete(table, key) {
            tracing::warn!(%table, key, error = %e, "cache delete failed");
        }
    }

    /// Decode a JSON value; undecodable records are logged and treated as missing.
    pub fn get_json<T: DeserializeOwned>(&self, table: Table, key: &str) -> Option<T> {
        let raw = self.get(table, key)?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(%table, key, error = %e, "cannot decode cached JSON");
                None
            }
        }
    }

    pub fn put_json<T: Serialize>(&self, table: Table, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(js) => self.put(table, key, &js),
            Err(e) => tracing::warn!(%table, key, error = %e, "cannot encode cache value"),
        }
    }

    /// Visit every record whose key starts with `prefix`, in key order.
    ///
    /// `visit` returns `Some(new_value)` to have that record rewritten, or
    /// `None` to leave it untouched. Reads and rewrites share one transaction
    /// and each key is visited at most once. Returns the number of rewrites.
    pub fn try_scan_prefix<F>(&self, table: Table, prefix: &str, mut visit: F) -> Result<usize>
    where
        F: FnMut(&str, &str) -> Option<String>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let matching: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT key, value FROM kv WHERE tbl = ?1 AND key >= ?2 ORDER BY key",
            )?;
            let mut rows = stmt.query(params![table.as_str(), prefix])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let key: String = row.get(0)?;
                if !key.starts_with(prefix) {
                    break;
                }
                out.push((key, row.get(1)?));
            }
            out
        };

        let mut rewritten = 0;
        for (key, value) in &matching {
            if let Some(new_value) = visit(key, value) {
                tx.execute(
                    "UPDATE kv SET value = ?3 WHERE tbl = ?1 AND key = ?2",
                    params![table.as_str(), key, new_value],
                )?;
                rewritten += 1;
            }
        }

        tx.commit()?;
        Ok(rewritten)
    }

    pub fn scan_prefix<F>(&self, table: Table, prefix: &str, visit: F) -> usize
    where
        F: FnMut(&str, &str) -> Option<String>,
    {
        self.try_scan_prefix(table, prefix, visit).unwrap_or_else(|e| {
            tracing::warn!(%table, prefix, error = %e, "cache scan failed");
            0
        })
    }

    /// Write every record of `table` as `key<SPACE>value` lines.
    pub fn dump<W: Write>(&self, table: Table, out: &mut W) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE tbl = ?1 ORDER BY key")?;
        let mut rows = stmt.query(params![table.as_str()])?;
        let mut count = 0;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;
            writeln!(out, "{key} {value}")?;
            count += 1;
        }
        Ok(count)
    }

    /// Bulk-load `key<SPACE>value` lines (the [`Cache::dump`] format) in one transaction.
    pub fn load<R: BufRead>(&self, table: Table, input: R) -> anyhow::Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut count = 0;
        for line in input.lines() {
            let line = line?;
            let line = line.trim_end();
            let Some((key, value)) = line.split_once(' ') else {
                if !line.is_empty() {
                    tracing::warn!(line, "skipping cache line without value");
                }
                continue;
            };
            tx.execute(
                "INSERT INTO kv (tbl, key, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(tbl, key) DO UPDATE SET value = excluded.value",
                params![table.as_str(), key, value],
            )?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let cache = Cache::in_memory().unwrap();
        cache.put(Table::Geocode, "u15xcf2", r#"{"cc":"NL"}"#);
        assert_eq!(
            cache.get(Table::Geocode, "u15xcf2").as_deref(),
            Some(r#"{"cc":"NL"}"#)
        );

        cache.delete(Table::Geocode, "u15xcf2");
        assert_eq!(cache.get(Table::Geocode, "u15xcf2"), None);
    }

    #[test]
    fn put_is_an_upsert() {
        let cache = Cache::in_memory().unwrap();
        cache.put(Table::Geocode, "k", "one");
        cache.put(Table::Geocode, "k", "two");
        assert_eq!(cache.get(Table::Geocode, "k").as_deref(), Some("two"));
    }

    #[test]
    fn tables_are_isolated() {
        let cache = Cache::in_memory().unwrap();
        cache.put(Table::Geocode, "k", "geo");
        assert_eq!(cache.get(Table::Waypoints, "k"), None);
    }

    #[test]
    fn scan_prefix_stops_at_prefix_boundary() {
        let cache = Cache::in_memory().unwrap();
        cache.put(Table::Waypoints, "a-1", "x");
        cache.put(Table::Waypoints, "a-2", "y");
        cache.put(Table::Waypoints, "b-1", "z");

        let mut seen = Vec::new();
        let rewrites = cache.scan_prefix(Table::Waypoints, "a-", |k, _| {
            seen.push(k.to_string());
            None
        });

        assert_eq!(seen, vec!["a-1", "a-2"]);
        assert_eq!(rewrites, 0);
    }

    #[test]
    fn scan_prefix_rewrites_only_when_asked() {
        let cache = Cache::in_memory().unwrap();
        cache.put(Table::Waypoints, "a-1", "x");
        cache.put(Table::Waypoints, "a-2", "y");

        let rewrites = cache.scan_prefix(Table::Waypoints, "a-", |k, v| {
            (k == "a-2").then(|| format!("{v}!"))
        });

        assert_eq!(rewrites, 1);
        assert_eq!(cache.get(Table::Waypoints, "a-1").as_deref(), Some("x"));
        assert_eq!(cache.get(Table::Waypoints, "a-2").as_deref(), Some("y!"));
    }

    #[test]
    fn dump_then_load_into_fresh_cache() {
        let cache = Cache::in_memory().unwrap();
        cache.put(Table::Geocode, "u0", r#"{"cc":"FR","addr":"Rue de la Paix"}"#);
        cache.put(Table::Geocode, "u1", r#"{"cc":"BE"}"#);

        let mut buf = Vec::new();
        assert_eq!(cache.dump(Table::Geocode, &mut buf).unwrap(), 2);

        let other = Cache::in_memory().unwrap();
        assert_eq!(other.load(Table::Geocode, buf.as_slice()).unwrap(), 2);
        assert_eq!(
            other.get(Table::Geocode, "u0").as_deref(),
            Some(r#"{"cc":"FR","addr":"Rue de la Paix"}"#)
        );
    }

    #[test]
    fn table_names_parse() {
        assert_eq!("ghash".parse::<Table>().unwrap(), Table::Geocode);
        assert_eq!("wp".parse::<Table>().unwrap(), Table::Waypoints);
        assert!("nope".parse::<Table>().is_err());
    }
}
