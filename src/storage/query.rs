//! Windowed reads over the log.
//!
//! A [`Scanner`] walks the partitions of one `(user, device)` either forward
//! (ascending partitions, file order) or backward (descending partitions,
//! lines read end-to-start) and materializes location lines into
//! [`LocationRecord`]s. The time window is half-open: `from <= t < to`, where
//! `t` is the line's leading timestamp.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::cache::geocode::GeocodeEntry;
use crate::cache::{Cache, Table};
use crate::error::{RecorderError, Result};
use crate::geo::geohash_encode;
use crate::storage::log::{parse_line, LogLine, LogStore, BASE_RELTOPIC};
use crate::storage::reverse::ReverseLines;
use crate::storage::isotime;

/// Default look-back when no start time is given.
pub const DEFAULT_HISTORY_HOURS: i64 = 6;

const NUMERIC_FIELDS: [&str; 10] = [
    "lat", "lon", "acc", "batt", "vel", "cog", "tst", "alt", "dist", "trip",
];
const STRING_FIELDS: [&str; 2] = ["tid", "t"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub from: i64,
    pub to: i64,
}

impl TimeWindow {
    pub fn new(from: i64, to: i64) -> Result<Self> {
        if from > to {
            return Err(RecorderError::Query(format!(
                "start {} is after end {}",
                isotime(from),
                isotime(to)
            )));
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, t: i64) -> bool {
        self.from <= t && t < self.to
    }
}

/// Parse a UTC time given as `YYYY-MM-DDTHH:MM:SS`, `YYYY-MM-DDTHH:MM`,
/// `YYYY-MM-DDTHH`, `YYYY-MM-DD` or `YYYY-MM`. A trailing `Z` is accepted.
pub fn parse_time(s: &str) -> Result<i64> {
    let t = s.trim();
    let t = t.strip_suffix('Z').unwrap_or(t);
    let full = match t.len() {
        19 => t.to_string(),
        16 => format!("{t}:00"),
        13 => format!("{t}:00:00"),
        10 => format!("{t}T00:00:00"),
        7 => format!("{t}-01T00:00:00"),
        _ => return Err(RecorderError::Query(format!("unrecognised time: {s}"))),
    };

    NaiveDateTime::parse_from_str(&full, "%Y-%m-%dT%H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|e| RecorderError::Query(format!("unrecognised time {s}: {e}")))
}

/// Build a window from optional textual bounds. Defaults: the last
/// [`DEFAULT_HISTORY_HOURS`] hours up to `now`.
pub fn make_window(from: Option<&str>, to: Option<&str>, now: i64) -> Result<TimeWindow> {
    let from = match from.filter(|s| !s.trim().is_empty()) {
        Some(s) => parse_time(s)?,
        None => now - DEFAULT_HISTORY_HOURS * 3600,
    };
    let to = match to.filter(|s| !s.trim().is_empty()) {
        Some(s) => parse_time(s)?,
        None => now,
    };
    TimeWindow::new(from, to)
}

/// One materialized location row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LocationRecord(Map<String, Value>);

impl LocationRecord {
    /// Build a record from a stored location payload. `isorcv` is the line
    /// timestamp. Returns `None` when the payload has no usable position.
    pub fn from_payload(
        payload: &Map<String, Value>,
        isorcv: &str,
        precision: usize,
        cache: Option<&Cache>,
    ) -> Option<Self> {
        let mut o = Map::new();

        for key in NUMERIC_FIELDS {
            let n = match payload.get(key) {
                Some(Value::Number(n)) => n.as_f64(),
                Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            if let Some(n) = n.filter(|n| n.is_finite()) {
                o.insert(key.to_string(), number(key, n));
            }
        }
        for key in STRING_FIELDS {
            if let Some(Value::String(s)) = payload.get(key) {
                o.insert(key.to_string(), Value::String(s.clone()));
            }
        }

        let lat = o.get("lat")?.as_f64()?;
        let lon = o.get("lon")?.as_f64()?;
        let ghash = geohash_encode(lat, lon, precision);

        o.insert("isorcv".into(), Value::String(isorcv.to_string()));
        if let Some(tst) = o.get("tst").and_then(Value::as_f64) {
            o.insert("isotst".into(), Value::String(isotime(tst as i64)));
        }

        if let Some(entry) = cache.and_then(|c| c.get_json::<GeocodeEntry>(Table::Geocode, &ghash)) {
            merge_geo(&mut o, &entry);
        }
        o.insert("ghash".into(), Value::String(ghash));

        Some(Self(o))
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn lat(&self) -> Option<f64> {
        self.number("lat")
    }

    pub fn lon(&self) -> Option<f64> {
        self.number("lon")
    }

    pub fn tst(&self) -> Option<i64> {
        self.number("tst").map(|t| t as i64)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Keep only `fields`, in the given order.
    pub fn project(&self, fields: &[String]) -> Map<String, Value> {
        fields
            .iter()
            .filter_map(|f| self.0.get(f).map(|v| (f.clone(), v.clone())))
            .collect()
    }
}

/// Store integral values as integers so they print without a fraction.
fn number(key: &str, n: f64) -> Value {
    if key != "lat" && key != "lon" && n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Copy the cached reverse-geocode fields into `o`.
pub(crate) fn merge_geo(o: &mut Map<String, Value>, entry: &GeocodeEntry) {
    let fields = [
        ("addr", entry.addr.as_ref()),
        ("cc", Some(&entry.cc)),
        ("locality", entry.locality.as_ref()),
        ("tzname", entry.tzname.as_ref()),
    ];
    for (key, value) in fields {
        if let Some(v) = value {
            o.insert(key.to_string(), Value::String(v.clone()));
        }
    }
}

/// The payload of a location line: relative topic `*`, JSON object with
/// `_type` `location`.
fn location_payload(line: &LogLine<'_>) -> Option<Map<String, Value>> {
    if line.reltopic != BASE_RELTOPIC {
        return None;
    }
    match serde_json::from_str::<Value>(line.payload).ok()? {
        Value::Object(map) if map.get("_type").and_then(Value::as_str) == Some("location") => {
            Some(map)
        }
        _ => None,
    }
}

pub struct Scanner<'a> {
    store: &'a LogStore,
    cache: Option<&'a Cache>,
    precision: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(store: &'a LogStore, cache: Option<&'a Cache>, precision: usize) -> Self {
        Self {
            store,
            cache,
            precision,
        }
    }

    fn record(&self, line: &LogLine<'_>) -> Option<LocationRecord> {
        let payload = location_payload(line)?;
        LocationRecord::from_payload(&payload, line.isotime, self.precision, self.cache)
    }

    /// Visit the lines of every partition in the window, oldest first.
    fn visit_forward<F>(&self, user: &str, device: &str, window: TimeWindow, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &LogLine<'_>) -> ControlFlow<()>,
    {
        for path in self.store.list_partitions(user, device, Some((window.from, window.to)))? {
            let fp = open(&path)?;
            for line in BufReader::new(fp).lines() {
                let raw = line.map_err(|e| RecorderError::storage(&path, e))?;
                let Some(parsed) = parse_line(&raw) else {
                    continue;
                };
                if !window.contains(parsed.time) {
                    continue;
                }
                if f(&raw, &parsed).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Visit the lines of every partition in the window, newest first.
    fn visit_backward<F>(&self, user: &str, device: &str, window: TimeWindow, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &LogLine<'_>) -> ControlFlow<()>,
    {
        let mut partitions = self.store.list_partitions(user, device, Some((window.from, window.to)))?;
        partitions.reverse();

        for path in partitions {
            let lines = ReverseLines::new(open(&path)?).map_err(|e| RecorderError::storage(&path, e))?;
            for line in lines {
                let raw = line.map_err(|e| RecorderError::storage(&path, e))?;
                let Some(parsed) = parse_line(&raw) else {
                    continue;
                };
                if !window.contains(parsed.time) {
                    continue;
                }
                if f(&raw, &parsed).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// All location records in the window, in log order.
    pub fn scan_forward(&self, user: &str, device: &str, window: TimeWindow) -> Result<Vec<LocationRecord>> {
        let mut out = Vec::new();
        self.visit_forward(user, device, window, |_, line| {
            out.extend(self.record(line));
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    /// At most `limit` location records in the window, newest first.
    pub fn scan_backward(
        &self,
        user: &str,
        device: &str,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<LocationRecord>> {
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }
        self.visit_backward(user, device, window, |_, line| {
            out.extend(self.record(line));
            if out.len() >= limit {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;
        Ok(out)
    }

    /// Full log lines in the window, in log order. With `limit`, only the
    /// newest `limit` lines are kept.
    pub fn raw_lines(
        &self,
        user: &str,
        device: &str,
        window: TimeWindow,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        self.collect_raw(user, device, window, limit, |raw, _| Some(raw.to_string()))
    }

    /// Payload column of the location lines in the window, in log order.
    pub fn raw_payloads(
        &self,
        user: &str,
        device: &str,
        window: TimeWindow,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        self.collect_raw(user, device, window, limit, |_, line| {
            location_payload(line).map(|_| line.payload.to_string())
        })
    }

    fn collect_raw<M>(
        &self,
        user: &str,
        device: &str,
        window: TimeWindow,
        limit: Option<usize>,
        mut map: M,
    ) -> Result<Vec<String>>
    where
        M: FnMut(&str, &LogLine<'_>) -> Option<String>,
    {
        let mut out = Vec::new();
        match limit {
            None => self.visit_forward(user, device, window, |raw, line| {
                out.extend(map(raw, line));
                ControlFlow::Continue(())
            })?,
            Some(0) => {}
            Some(n) => {
                self.visit_backward(user, device, window, |raw, line| {
                    out.extend(map(raw, line));
                    if out.len() >= n {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                })?;
                out.reverse();
            }
        }
        Ok(out)
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| RecorderError::storage(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn time_formats() {
        assert_eq!(parse_time("2023-11-14T22:13:20").unwrap(), 1_700_000_000);
        assert_eq!(parse_time("2023-11-14T22:13:20Z").unwrap(), 1_700_000_000);
        assert_eq!(parse_time("2023-11-14T22:13").unwrap(), 1_700_000_000 - 20);
        assert_eq!(parse_time("2023-11-14T22").unwrap(), 1_700_000_000 - 13 * 60 - 20);
        assert_eq!(parse_time("1970-01-02").unwrap(), 86_400);
        assert_eq!(parse_time("1970-02").unwrap(), 31 * 86_400);
        assert!(parse_time("yesterday").is_err());
        assert!(parse_time("2023-13-01").is_err());
    }

    #[test]
    fn window_defaults_and_order() {
        let w = make_window(None, None, 100_000).unwrap();
        assert_eq!(w, TimeWindow { from: 100_000 - 6 * 3600, to: 100_000 });
        assert!(make_window(Some("1970-02"), Some("1970-01"), 0).is_err());
    }

    #[test]
    fn window_is_half_open() {
        let w = TimeWindow::new(10, 20).unwrap();
        assert!(w.contains(10));
        assert!(w.contains(19));
        assert!(!w.contains(20));
    }

    #[test]
    fn record_from_payload_normalizes() {
        let payload = json!({
            "_type": "location", "tid": "JJ", "lat": "52.0", "lon": 5.0,
            "tst": 1_700_000_000, "batt": 80, "vel": "12", "extra": true
        });
        let rec = LocationRecord::from_payload(
            payload.as_object().unwrap(),
            "2023-11-14T22:13:21Z",
            7,
            None,
        )
        .unwrap();

        assert_eq!(rec.lat(), Some(52.0));
        assert_eq!(rec.get("vel"), Some(&json!(12)));
        assert_eq!(rec.get("ghash"), Some(&json!("u15xcf2")));
        assert_eq!(rec.get("isotst"), Some(&json!("2023-11-14T22:13:20Z")));
        assert!(rec.get("extra").is_none());
    }

    #[test]
    fn record_needs_position() {
        let payload = json!({"_type": "location", "tst": 1});
        assert!(LocationRecord::from_payload(payload.as_object().unwrap(), "x", 7, None).is_none());
    }

    #[test]
    fn record_picks_up_cached_geo() {
        let cache = Cache::in_memory().unwrap();
        cache.put(Table::Geocode, "u15xcf2", r#"{"cc":"NL","addr":"Somewhere","tst":1}"#);
        let payload = json!({"_type": "location", "lat": 52.0, "lon": 5.0});
        let rec = LocationRecord::from_payload(payload.as_object().unwrap(), "x", 7, Some(&cache))
            .unwrap();
        assert_eq!(rec.get("cc"), Some(&json!("NL")));
        assert_eq!(rec.get("addr"), Some(&json!("Somewhere")));
    }
}
