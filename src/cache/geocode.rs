//! Reverse-geocode memoization keyed by geohash.
//!
//! Freshness is decided here, on the caller side of the cache: an entry is
//! used as-is while `now - tst <= max_age` (or always, when `max_age` is 0).
//! Stale or absent entries are refetched and replaced with `delete` + `put`.
//! When the provider fails the event proceeds with `cc = "??"` and the miss is
//! appended to the backfill file.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Cache, Table};
use crate::geo::revgeo::{GeoInfo, ReverseGeocoder};

/// Placeholder country code for positions without geo data.
pub const UNKNOWN_CC: &str = "??";

/// Value stored in the `geocode` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeEntry {
    pub cc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tzname: Option<String>,
    /// When the entry was cached (epoch seconds).
    #[serde(default)]
    pub tst: i64,
}

impl GeocodeEntry {
    pub fn from_info(info: GeoInfo, now: i64) -> Self {
        Self {
            cc: info.cc,
            addr: info.addr,
            locality: info.locality,
            tzname: info.tzname,
            tst: now,
        }
    }

    pub fn is_fresh(&self, now: i64, max_age_secs: i64) -> bool {
        max_age_secs <= 0 || now - self.tst <= max_age_secs
    }

    pub fn info(&self) -> GeoInfo {
        GeoInfo {
            cc: self.cc.clone(),
            addr: self.addr.clone(),
            locality: self.locality.clone(),
            tzname: self.tzname.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoSource {
    Cached,
    Fetched,
    /// Provider failed or no provider is configured.
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub geo: GeoInfo,
    pub source: GeoSource,
}

#[derive(Debug, Clone, Copy)]
pub struct GeocodePolicy {
    pub max_age_secs: i64,
    pub timeout: Duration,
}

/// Look up `ghash` in the cache, falling back to `geocoder` when the entry is
/// stale or absent.
pub fn resolve(
    cache: &Cache,
    geocoder: Option<&dyn ReverseGeocoder>,
    policy: GeocodePolicy,
    missing_file: Option<&Path>,
    ghash: &str,
    lat: f64,
    lon: f64,
    now: i64,
) -> Resolution {
    let cached: Option<GeocodeEntry> = cache.get_json(Table::Geocode, ghash);

    if let Some(entry) = &cached {
        if entry.is_fresh(now, policy.max_age_secs) || geocoder.is_none() {
            return Resolution {
                geo: entry.info(),
                source: GeoSource::Cached,
            };
        }
    }

    let Some(geocoder) = geocoder else {
        return unavailable();
    };

    match geocoder.reverse(lat, lon, policy.timeout) {
        Ok(info) => {
            let entry = GeocodeEntry::from_info(info, now);
            if cached.is_some() {
                cache.delete(Table::Geocode, ghash);
            }
            cache.put_json(Table::Geocode, ghash, &entry);
            tracing::debug!(ghash, provider = geocoder.name(), cc = %entry.cc, "geocode cached");
            Resolution {
                geo: entry.info(),
                source: GeoSource::Fetched,
            }
        }
        Err(e) => {
            tracing::warn!(ghash, lat, lon, provider = geocoder.name(), error = %e, "reverse geocode failed");
            if let Some(path) = missing_file {
                record_missing(path, ghash, lat, lon);
            }
            unavailable()
        }
    }
}

fn unavailable() -> Resolution {
    Resolution {
        geo: GeoInfo {
            cc: UNKNOWN_CC.to_string(),
            addr: None,
            locality: None,
            tzname: None,
        },
        source: GeoSource::Unavailable,
    }
}

/// Append `ghash lat lon` to the backfill file. Best effort.
pub fn record_missing(path: &Path, ghash: &str, lat: f64, lon: f64) {
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut fp = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(fp, "{ghash} {lat:.6} {lon:.6}")
    })();

    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "cannot record missing geohash");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecorderError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedGeocoder {
        calls: AtomicUsize,
        fail: bool,
    }

    impl ReverseGeocoder for FixedGeocoder {
        fn reverse(&self, _lat: f64, _lon: f64, _timeout: Duration) -> crate::error::Result<GeoInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RecorderError::UpstreamGeocode("timeout".into()));
            }
            Ok(GeoInfo {
                cc: "NL".into(),
                addr: Some("Domplein, Utrecht".into()),
                locality: Some("Utrecht".into()),
                tzname: Some("Europe/Amsterdam".into()),
            })
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn policy(max_age_secs: i64) -> GeocodePolicy {
        GeocodePolicy {
            max_age_secs,
            timeout: Duration::from_millis(10),
        }
    }

    #[test]
    fn miss_fetches_and_caches() {
        let cache = Cache::in_memory().unwrap();
        let geo = FixedGeocoder { calls: AtomicUsize::new(0), fail: false };

        let first = resolve(&cache, Some(&geo), policy(0), None, "u178", 52.0, 5.0, 100);
        assert_eq!(first.source, GeoSource::Fetched);
        let second = resolve(&cache, Some(&geo), policy(0), None, "u178", 52.0, 5.0, 200);
        assert_eq!(second.source, GeoSource::Cached);
        assert_eq!(second.geo.cc, "NL");
        assert_eq!(geo.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_entry_is_replaced() {
        let cache = Cache::in_memory().unwrap();
        let old = GeocodeEntry {
            cc: "DE".into(),
            addr: None,
            locality: None,
            tzname: None,
            tst: 0,
        };
        cache.put_json(Table::Geocode, "u178", &old);
        let geo = FixedGeocoder { calls: AtomicUsize::new(0), fail: false };

        let res = resolve(&cache, Some(&geo), policy(60), None, "u178", 52.0, 5.0, 1000);
        assert_eq!(res.source, GeoSource::Fetched);
        let stored: GeocodeEntry = cache.get_json(Table::Geocode, "u178").unwrap();
        assert_eq!(stored.cc, "NL");
        assert_eq!(stored.tst, 1000);
    }

    #[test]
    fn failure_degrades_and_records_missing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("ghash").join("missing");
        let cache = Cache::in_memory().unwrap();
        let geo = FixedGeocoder { calls: AtomicUsize::new(0), fail: true };

        let res = resolve(&cache, Some(&geo), policy(0), Some(&missing), "u178", 52.0, 5.0, 1);
        assert_eq!(res.source, GeoSource::Unavailable);
        assert_eq!(res.geo.cc, UNKNOWN_CC);
        assert!(res.geo.addr.is_none());
        assert!(cache.get(Table::Geocode, "u178").is_none());

        let body = std::fs::read_to_string(&missing).unwrap();
        assert_eq!(body, "u178 52.000000 5.000000\n");
    }

    #[test]
    fn freshness_window() {
        let entry = GeocodeEntry {
            cc: "NL".into(),
            addr: None,
            locality: None,
            tzname: None,
            tst: 100,
        };
        assert!(entry.is_fresh(10_000, 0));
        assert!(entry.is_fresh(150, 50));
        assert!(!entry.is_fresh(151, 50));
    }
}
