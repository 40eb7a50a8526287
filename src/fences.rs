//! Geofence ENTER/LEAVE detection.
//!
//! Fences live in the cache's `waypoints` table under
//! [`WaypointKey`](crate::cache::keys::WaypointKey). For each position sample
//! the owner's fences and then the global fences are scanned; a fence's `io`
//! flag is flipped, and the record rewritten, only when the sample crosses its
//! radius.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::keys::{WaypointKey, GLOBAL_OWNER};
use crate::cache::{Cache, Table};
use crate::geo::{geohash_encode, haversine_distance};

/// Stored fence definition and its inside/outside state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lon: f64,
    /// Radius in meters.
    pub rad: f64,
    #[serde(default)]
    pub desc: String,
    /// `true` while the device is inside the fence.
    #[serde(default)]
    pub io: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceEvent {
    Enter,
    Leave,
}

impl FenceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Leave => "leave",
        }
    }
}

impl std::fmt::Display for FenceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected crossing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub event: FenceEvent,
    /// Fence owner; `_`/`_` for global fences.
    pub owner_user: String,
    pub owner_device: String,
    pub desc: String,
    pub wplat: f64,
    pub wplon: f64,
    pub lat: f64,
    pub lon: f64,
    /// Distance from the fence center in meters.
    pub dist: f64,
}

/// Apply the crossing rule to one fence. Returns the event when `io` flipped.
pub fn check_waypoint(wp: &mut Waypoint, lat: f64, lon: f64) -> Option<(FenceEvent, f64)> {
    let dist = haversine_distance(wp.lat, wp.lon, lat, lon);

    if dist < wp.rad {
        if !wp.io {
            wp.io = true;
            return Some((FenceEvent::Enter, dist));
        }
    } else if wp.io {
        wp.io = false;
        return Some((FenceEvent::Leave, dist));
    }
    None
}

fn scan_owner(cache: &Cache, owner: (&str, &str), lat: f64, lon: f64, out: &mut Vec<Transition>) {
    let prefix = WaypointKey::owner_prefix(owner.0, owner.1);

    cache.scan_prefix(Table::Waypoints, &prefix, |key, value| {
        let mut wp: Waypoint = match serde_json::from_str(value) {
            Ok(wp) => wp,
            Err(e) => {
                tracing::warn!(key, error = %e, "skipping undecodable waypoint");
                return None;
            }
        };

        let (event, dist) = check_waypoint(&mut wp, lat, lon)?;
        tracing::info!(key, %event, desc = %wp.desc, dist, "geofence transition");
        out.push(Transition {
            event,
            owner_user: owner.0.to_string(),
            owner_device: owner.1.to_string(),
            desc: wp.desc.clone(),
            wplat: wp.lat,
            wplon: wp.lon,
            lat,
            lon,
            dist,
        });

        match serde_json::to_string(&wp) {
            Ok(js) => Some(js),
            Err(e) => {
                tracing::warn!(key, error = %e, "cannot encode waypoint");
                None
            }
        }
    });
}

/// Check a position against the fences of `(user, device)` and then the
/// global fences, persisting state changes. Returns the transitions in scan
/// order.
pub fn check_fences(cache: &Cache, user: &str, device: &str, lat: f64, lon: f64) -> Vec<Transition> {
    let mut out = Vec::new();
    scan_owner(cache, (user, device), lat, lon, &mut out);
    if (user, device) != GLOBAL_OWNER {
        scan_owner(cache, GLOBAL_OWNER, lat, lon, &mut out);
    }
    out
}

/// Store one fence, keeping the `io` state of an existing fence at the same center.
pub fn put_waypoint(cache: &Cache, user: &str, device: &str, wp: Waypoint, precision: usize) -> WaypointKey {
    let key = WaypointKey::new(user, device, &geohash_encode(wp.lat, wp.lon, precision));
    let encoded = key.encode();

    let io = cache
        .get_json::<Waypoint>(Table::Waypoints, &encoded)
        .map(|old| old.io)
        .unwrap_or(false);

    cache.put_json(Table::Waypoints, &encoded, &Waypoint { io, ..wp });
    key
}

/// Build a fence from a `waypoint` payload object. Requires numeric `lat`,
/// `lon` and a positive `rad`.
pub fn waypoint_from_json(obj: &Value) -> Option<Waypoint> {
    let num = |k: &str| -> Option<f64> {
        match obj.get(k)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };

    let rad = num("rad")?;
    if rad <= 0.0 {
        return None;
    }
    Some(Waypoint {
        lat: num("lat")?,
        lon: num("lon")?,
        rad,
        desc: obj
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        io: false,
    })
}

/// Import every usable entry of a `waypoints` array. Returns the number loaded.
pub fn load_waypoints(cache: &Cache, user: &str, device: &str, list: &[Value], precision: usize) -> usize {
    let mut loaded = 0;
    for item in list {
        match waypoint_from_json(item) {
            Some(wp) => {
                let key = put_waypoint(cache, user, device, wp, precision);
                tracing::debug!(key = %key, "waypoint loaded");
                loaded += 1;
            }
            None => tracing::debug!(user, device, "skipping waypoint without lat/lon/rad"),
        }
    }
    loaded
}

/// All fences of `(user, device)`, in key order.
pub fn list_waypoints(cache: &Cache, user: &str, device: &str) -> Vec<(WaypointKey, Waypoint)> {
    let mut out = Vec::new();
    cache.scan_prefix(Table::Waypoints, &WaypointKey::owner_prefix(user, device), |k, v| {
        if let (Some(key), Ok(wp)) = (WaypointKey::decode(k), serde_json::from_str(v)) {
            out.push((key, wp));
        }
        None
    });
    out
}
