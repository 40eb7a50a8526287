//! Structured cache keys.
//!
//! Waypoint keys are `<user>-<device>-<geohash>`. Each component is escaped so
//! that it never contains a bare `-`: `%` becomes `%25` and `-` becomes `%2D`.
//! A user named `a-b` with device `c` therefore cannot collide with user `a`
//! and device `b-c`, and the owner prefix `<user>-<device>-` matches only that
//! owner's fences.

use std::fmt;

/// Owner used for fences that apply to every device.
pub const GLOBAL_OWNER: (&str, &str) = ("_", "_");

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for ch in component.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '-' => out.push_str("%2D"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(component: &str) -> String {
    component.replace("%2D", "-").replace("%25", "%")
}

/// Key of one geofence in the `waypoints` table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaypointKey {
    pub user: String,
    pub device: String,
    pub ghash: String,
}

impl WaypointKey {
    pub fn new(user: &str, device: &str, ghash: &str) -> Self {
        Self {
            user: user.to_string(),
            device: device.to_string(),
            ghash: ghash.to_string(),
        }
    }

    /// Prefix shared by every fence of `(user, device)`.
    pub fn owner_prefix(user: &str, device: &str) -> String {
        format!("{}-{}-", escape(user), escape(device))
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{}",
            Self::owner_prefix(&self.user, &self.device),
            escape(&self.ghash)
        )
    }

    /// Inverse of [`WaypointKey::encode`]; `None` for keys not in that shape.
    pub fn decode(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, '-');
        let user = parts.next()?;
        let device = parts.next()?;
        let ghash = parts.next()?;
        if ghash.contains('-') {
            return None;
        }
        Some(Self {
            user: unescape(user),
            device: unescape(device),
            ghash: unescape(ghash),
        })
    }
}

impl fmt::Display for WaypointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
