//! Append-only, month-partitioned event log.
//!
//! Each line is `isotime<TAB>reltopic<TAB>payload`, with the relative topic
//! left-aligned to 18 columns. A payload never contains a newline or a tab:
//! JSON payloads are re-serialized compactly and anything else that is not a
//! single printable line is hex-dumped. Files are only ever appended to.

use std::borrow::Cow;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::error::{RecorderError, Result};
use crate::storage::{isotime, list_subdirs, month_index, StorageLayout};

/// Relative topic recorded for messages published on the base topic itself.
pub const BASE_RELTOPIC: &str = "*";

/// Render `payload` as one printable line: printable characters are kept and
/// every other byte becomes ` XX ` (two upper-case hex digits).
pub fn bindump(payload: &[u8]) -> String {
    fn push_hex(out: &mut String, bytes: &[u8]) {
        for b in bytes {
            out.push_str(&format!(" {b:02X} "));
        }
    }

    let mut out = String::with_capacity(payload.len());

    match std::str::from_utf8(payload) {
        Ok(s) => {
            for ch in s.chars() {
                if ch.is_control() {
                    let mut buf = [0u8; 4];
                    push_hex(&mut out, ch.encode_utf8(&mut buf).as_bytes());
                } else {
                    out.push(ch);
                }
            }
        }
        Err(_) => {
            for &b in payload {
                if b.is_ascii_graphic() || b == b' ' {
                    out.push(b as char);
                } else {
                    push_hex(&mut out, &[b]);
                }
            }
        }
    }
    out
}

/// The payload column for `payload`, borrowed when it is already a safe line.
pub fn line_payload(payload: &[u8]) -> Cow<'_, str> {
    if let Ok(s) = std::str::from_utf8(payload) {
        if !s.chars().any(char::is_control) {
            return Cow::Borrowed(s);
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(s) {
            if let Ok(compact) = serde_json::to_string(&value) {
                return Cow::Owned(compact);
            }
        }
    }
    Cow::Owned(bindump(payload))
}

/// The topic column for `reltopic`. Control characters are written as
/// escapes so a record never spans two lines.
pub fn line_reltopic(reltopic: &str) -> Cow<'_, str> {
    if !reltopic.chars().any(char::is_control) {
        return Cow::Borrowed(reltopic);
    }
    let mut out = String::with_capacity(reltopic.len() + 8);
    for c in reltopic.chars() {
        if c.is_control() {
            out.extend(c.escape_default());
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Format one log line, including its terminator.
pub fn format_line(epoch: i64, reltopic: &str, payload: &[u8]) -> String {
    format!(
        "{}\t{:<18}\t{}\n",
        isotime(epoch),
        line_reltopic(reltopic),
        line_payload(payload)
    )
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine<'a> {
    pub isotime: &'a str,
    pub time: i64,
    pub reltopic: &'a str,
    pub payload: &'a str,
}

/// Split a log line into its columns. Lines without a leading ISO timestamp
/// are rejected.
pub fn parse_line(line: &str) -> Option<LogLine<'_>> {
    let mut cols = line.splitn(3, '\t');
    let stamp = cols.next()?;
    let reltopic = cols.next()?.trim_end();
    let payload = cols.next()?.trim_end_matches(['\r', '\n']);

    let time = chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%SZ")
        .ok()?
        .and_utc()
        .timestamp();

    Some(LogLine {
        isotime: stamp,
        time,
        reltopic,
        payload,
    })
}

/// File name of a partition (`YYYY-MM.rec`) as a month index.
fn partition_month(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".rec")?;
    let (y, m) = stem.split_once('-')?;
    if y.len() != 4 || m.len() != 2 || !y.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (y, m): (i64, i64) = (y.parse().ok()?, m.parse().ok()?);
    if !(1..=12).contains(&m) {
        return None;
    }
    Some(y * 12 + m - 1)
}

#[derive(Debug, Clone)]
pub struct LogStore {
    layout: StorageLayout,
}

impl LogStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Append one event to the partition of the month containing `epoch`.
    /// Returns the partition written to.
    pub fn append(
        &self,
        user: &str,
        device: &str,
        epoch: i64,
        reltopic: &str,
        payload: &[u8],
    ) -> Result<PathBuf> {
        let path = self.layout.partition(user, device, epoch);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RecorderError::storage(parent, e))?;
        }

        let line = format_line(epoch, reltopic, payload);
        let mut fp = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RecorderError::storage(&path, e))?;
        fp.write_all(line.as_bytes())
            .map_err(|e| RecorderError::storage(&path, e))?;

        Ok(path)
    }

    pub fn list_users(&self) -> Result<Vec<String>> {
        list_subdirs(&self.layout.rec_root())
    }

    pub fn list_devices(&self, user: &str) -> Result<Vec<String>> {
        list_subdirs(&self.layout.rec_root().join(super::sanitize(user)))
    }

    /// Partitions of `(user, device)` whose month overlaps `[from, to]`, in
    /// ascending (chronological) order. `None` lists every partition.
    pub fn list_partitions(
        &self,
        user: &str,
        device: &str,
        window: Option<(i64, i64)>,
    ) -> Result<Vec<PathBuf>> {
        let dir = self.layout.rec_dir(user, device);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RecorderError::storage(&dir, e)),
        };

        let bounds = window.map(|(from, to)| (month_index(from), month_index(to)));
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RecorderError::storage(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(month) = partition_month(&name) else {
                continue;
            };
            if let Some((lo, hi)) = bounds {
                if month < lo || month > hi {
                    continue;
                }
            }
            names.push(name);
        }
        names.sort();

        Ok(names.into_iter().map(|n| dir.join(n)).collect())
    }

    /// Delete every file in the log directory of `(user, device)` and the
    /// directory itself. Returns the names of the removed files.
    pub fn kill(&self, user: &str, device: &str) -> Result<Vec<String>> {
        let dir = self.layout.rec_dir(user, device);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RecorderError::storage(&dir, e)),
        };

        let mut killed = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RecorderError::storage(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => killed.push(name),
                Err(e) => tracing::warn!(path = %entry.path().display(), error = %e, "cannot remove partition"),
            }
        }
        killed.sort();

        if let Err(e) = fs::remove_dir(&dir) {
            tracing::warn!(path = %dir.display(), error = %e, "cannot remove log directory");
        }
        tracing::info!(user, device, files = killed.len(), "device log removed");
        Ok(killed)
    }
}
