//! On-disk layout of the store.
//!
//! ```text
//! <root>/rec/<user>/<device>/YYYY-MM.rec          time-partitioned log
//! <root>/last/<user>/<device>/<user>-<device>.json last known state
//! <root>/cards/<user>/<device>.json               card payloads
//! <root>/photos/<user>/<device>.png               decoded avatars
//! <root>/config/<user>/<device>/<user>-<device>.otrc
//! <root>/waypoints/<user>/<device>/<user>-<device>.otrw
//! <root>/waypoints/<user>/<device>/<isotst>.json  single waypoint events
//! <root>/ghash/cache.db                           key-value cache
//! <root>/ghash/missing                            geocode backfill list
//! ```
//!
//! User and device names are lower-cased and every non-alphanumeric character
//! is replaced by `-` before they touch the filesystem.

pub mod log;
pub mod output;
pub mod query;
pub mod reverse;
pub mod snapshot;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};

use crate::error::{RecorderError, Result};

/// Make a user or device name safe for use as a path component.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or('-')
            } else {
                '-'
            }
        })
        .collect()
}

/// `YYYY-MM-DDTHH:MM:SSZ` for an epoch timestamp.
pub fn isotime(epoch: i64) -> String {
    utc(epoch).format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// `YYYY-MM`, the partition name of the month containing `epoch`.
pub fn month_of(epoch: i64) -> String {
    utc(epoch).format("%Y-%m").to_string()
}

/// Months since year 0, for comparing partitions against a window.
pub(crate) fn month_index(epoch: i64) -> i64 {
    let t = utc(epoch);
    i64::from(t.year()) * 12 + i64::from(t.month0())
}

fn utc(epoch: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch, 0).unwrap_or_default()
}

/// Write `contents` to a sibling `<name>.tmp` and rename it over `path`, so
/// readers see either the old or the new document. A trailing newline is
/// added when missing.
pub fn safewrite(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RecorderError::storage(parent, e))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let write = || -> std::io::Result<()> {
        let mut fp = fs::File::create(&tmp)?;
        fp.write_all(contents)?;
        if !contents.ends_with(b"\n") {
            fp.write_all(b"\n")?;
        }
        fp.sync_all()
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(RecorderError::storage(&tmp, e));
    }

    fs::rename(&tmp, path).map_err(|e| RecorderError::storage(path, e))
}

/// Plain (non-atomic) write that creates parent directories.
pub(crate) fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RecorderError::storage(parent, e))?;
    }
    fs::write(path, contents).map_err(|e| RecorderError::storage(path, e))
}

/// Path builder rooted at the storage directory.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, area: &str, user: &str, device: &str) -> PathBuf {
        self.root.join(area).join(sanitize(user)).join(sanitize(device))
    }

    fn owner_file(&self, area: &str, user: &str, device: &str, ext: &str) -> PathBuf {
        self.owner_dir(area, user, device)
            .join(format!("{}-{}.{ext}", sanitize(user), sanitize(device)))
    }

    pub fn rec_root(&self) -> PathBuf {
        self.root.join("rec")
    }

    pub fn rec_dir(&self, user: &str, device: &str) -> PathBuf {
        self.owner_dir("rec", user, device)
    }

    pub fn partition(&self, user: &str, device: &str, epoch: i64) -> PathBuf {
        self.rec_dir(user, device).join(format!("{}.rec", month_of(epoch)))
    }

    pub fn last_root(&self) -> PathBuf {
        self.root.join("last")
    }

    pub fn snapshot(&self, user: &str, device: &str) -> PathBuf {
        self.owner_file("last", user, device, "json")
    }

    pub fn card(&self, user: &str, device: &str) -> PathBuf {
        self.root
            .join("cards")
            .join(sanitize(user))
            .join(format!("{}.json", sanitize(device)))
    }

    /// Card shared by all devices of `user`.
    pub fn user_card(&self, user: &str) -> PathBuf {
        self.card(user, user)
    }

    pub fn photo(&self, user: &str, device: &str) -> PathBuf {
        self.root
            .join("photos")
            .join(sanitize(user))
            .join(format!("{}.png", sanitize(device)))
    }

    pub fn config_dump(&self, user: &str, device: &str) -> PathBuf {
        self.owner_file("config", user, device, "otrc")
    }

    pub fn waypoints_dump(&self, user: &str, device: &str) -> PathBuf {
        self.owner_file("waypoints", user, device, "otrw")
    }

    pub fn waypoint_event(&self, user: &str, device: &str, isotst: &str) -> PathBuf {
        self.owner_dir("waypoints", user, device)
            .join(format!("{isotst}.json"))
    }

    pub fn cache_db(&self) -> PathBuf {
        self.root.join("ghash").join("cache.db")
    }

    pub fn missing_ghash(&self) -> PathBuf {
        self.root.join("ghash").join("missing")
    }
}

/// Names of the visible subdirectories of `dir`, sorted. A missing directory
/// yields an empty list.
pub(crate) fn list_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(RecorderError::storage(dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| RecorderError::storage(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_lowercases_and_replaces() {
        assert_eq!(sanitize("Jane"), "jane");
        assert_eq!(sanitize("my phone/../x"), "my-phone----x");
        assert_eq!(sanitize("Ünïcode"), "ünïcode");
    }

    #[test]
    fn layout_paths() {
        let layout = StorageLayout::new("/s");
        assert_eq!(
            layout.partition("Jane", "Phone", 1_700_000_000),
            PathBuf::from("/s/rec/jane/phone/2023-11.rec")
        );
        assert_eq!(
            layout.snapshot("jane", "phone"),
            PathBuf::from("/s/last/jane/phone/jane-phone.json")
        );
        assert_eq!(layout.user_card("jane"), PathBuf::from("/s/cards/jane/jane.json"));
        assert_eq!(
            layout.waypoints_dump("jane", "phone"),
            PathBuf::from("/s/waypoints/jane/phone/jane-phone.otrw")
        );
    }

    #[test]
    fn isotime_format() {
        assert_eq!(isotime(0), "1970-01-01T00:00:00Z");
        assert_eq!(isotime(1_700_000_000), "2023-11-14T22:13:20Z");
        assert_eq!(month_of(1_700_000_000), "2023-11");
    }

    #[test]
    fn safewrite_replaces_and_terminates() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a").join("b.json");

        safewrite(&path, b"{\"v\":1}").unwrap();
        safewrite(&path, b"{\"v\":2}\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"v\":2}\n");
        assert!(!path.with_file_name("b.json.tmp").exists());
    }
}
