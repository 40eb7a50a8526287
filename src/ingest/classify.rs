//! Payload classification and numeric normalization.
//!
//! A payload is decoded as a JSON object or, failing that, as a Greenwich CSV
//! location line. Anything else stays [`Classified::Raw`] and is logged
//! verbatim.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{RecorderError, Result};

/// Closed set of payload kinds. Unrecognised or missing `_type` is
/// [`PayloadKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Location,
    Beacon,
    Card,
    Cmd,
    Lwt,
    Steps,
    Transition,
    Waypoint,
    Waypoints,
    Dump,
    Request,
    Encrypted,
    Unknown,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::Beacon => "beacon",
            Self::Card => "card",
            Self::Cmd => "cmd",
            Self::Lwt => "lwt",
            Self::Steps => "steps",
            Self::Transition => "transition",
            Self::Waypoint => "waypoint",
            Self::Waypoints => "waypoints",
            Self::Dump => "dump",
            Self::Request => "request",
            Self::Encrypted => "encrypted",
            Self::Unknown => "unknown",
        }
    }

    /// Kinds that run through geocoding, storage and the snapshot/waypoint files.
    pub fn is_location_like(&self) -> bool {
        matches!(self, Self::Location | Self::Waypoint | Self::Transition)
    }

    /// Kind of a decoded object, from its `_type` member.
    pub fn of(body: &Map<String, Value>) -> Self {
        body.get("_type")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(Self::Unknown)
    }
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "location" => Ok(Self::Location),
            "beacon" => Ok(Self::Beacon),
            "card" => Ok(Self::Card),
            "cmd" => Ok(Self::Cmd),
            "lwt" => Ok(Self::Lwt),
            "steps" => Ok(Self::Steps),
            "transition" => Ok(Self::Transition),
            "waypoint" => Ok(Self::Waypoint),
            "waypoints" => Ok(Self::Waypoints),
            "dump" => Ok(Self::Dump),
            "request" => Ok(Self::Request),
            "encrypted" => Ok(Self::Encrypted),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("unknown payload type: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Payload {
        kind: PayloadKind,
        body: Map<String, Value>,
        /// Decoded from a CSV line rather than JSON.
        csv: bool,
    },
    Raw(Vec<u8>),
}

/// `tid,tst(hex),t,lat*1e6,lon*1e6,cog/10,vel,alt/10,dist,trip/1000`
static CSV_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^([[:alnum:]]+),([[:xdigit:]]+),([[:alnum:]]),([[:digit:]]+),([[:digit:]]+),([[:digit:]]+),([[:digit:]]+),([[:digit:]]+),([[:digit:]]+),([[:digit:]]+)$",
    )
    .ok()
});

/// Decode a Greenwich CSV location line, e.g.
/// `X0,542A46AA,k,30365854,7575769,26,4,7,5,872`.
pub fn csv_to_json(line: &str) -> Option<Map<String, Value>> {
    let re = CSV_LINE.as_ref()?;
    let caps = re.captures(line.trim_end())?;
    let num = |i: usize| -> Option<f64> { caps.get(i)?.as_str().parse().ok() };

    let tst = i64::from_str_radix(caps.get(2)?.as_str(), 16).ok()?;
    let mut o = Map::new();
    o.insert("_type".into(), "location".into());
    o.insert("t".into(), caps.get(3)?.as_str().into());
    o.insert("tid".into(), caps.get(1)?.as_str().into());
    o.insert("tst".into(), tst.into());
    o.insert("lat".into(), (num(4)? / 1_000_000.0).into());
    o.insert("lon".into(), (num(5)? / 1_000_000.0).into());
    o.insert("cog".into(), (num(6)? * 10.0).into());
    o.insert("vel".into(), num(7)?.into());
    o.insert("alt".into(), (num(8)? * 10.0).into());
    o.insert("dist".into(), num(9)?.into());
    o.insert("trip".into(), (num(10)? * 1000.0).into());
    o.insert("csv".into(), true.into());
    Some(o)
}

/// Decode `raw` into a typed payload, or keep it raw.
pub fn classify(raw: &[u8]) -> Classified {
    if let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(raw) {
        return Classified::Payload {
            kind: PayloadKind::of(&body),
            body,
            csv: false,
        };
    }

    if let Some(body) = std::str::from_utf8(raw).ok().and_then(csv_to_json) {
        return Classified::Payload {
            kind: PayloadKind::Location,
            body,
            csv: true,
        };
    }

    Classified::Raw(raw.to_vec())
}

/// Position and time of a normalized location-like payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub tst: i64,
    pub lat: f64,
    pub lon: f64,
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Rewrite `tst`, `lat`, `lon` and `acc` as numbers. A missing `tst` is set
/// to `now`. Missing or non-numeric `lat`/`lon` rejects the payload.
pub fn normalize(body: &mut Map<String, Value>, now: i64) -> Result<Position> {
    let tst = match body.get("tst") {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(v @ Value::String(_)) => numeric(v).filter(|f| f.is_finite()).map(|f| f as i64),
        _ => None,
    }
    .unwrap_or(now);
    body.insert("tst".into(), tst.into());

    let mut coord = |key: &str| -> Result<f64> {
        let v = body
            .get(key)
            .and_then(numeric)
            .filter(|v| !v.is_nan())
            .ok_or_else(|| RecorderError::MalformedInput(format!("{key} missing or not a number")))?;
        body.insert(key.to_string(), v.into());
        Ok(v)
    };
    let lat = coord("lat")?;
    let lon = coord("lon")?;

    if let Some(acc) = body.get("acc").and_then(numeric) {
        body.insert("acc".into(), acc.into());
    }

    Ok(Position { tst, lat, lon })
}
