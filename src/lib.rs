//! Location recorder for OwnTracks-style trackers.
//!
//! trackstore receives location and status publishes over MQTT or HTTP,
//! enriches location fixes with a cached reverse-geocode lookup, detects
//! geofence enter/leave transitions, and keeps everything on disk:
//!
//! | Area | Contents |
//! |------|----------|
//! | `rec/<user>/<device>/YYYY-MM.rec` | Append-only monthly event log |
//! | `last/<user>/<device>/` | Latest location snapshot per device |
//! | `cards/`, `photos/` | Contact cards and avatars |
//! | `config/`, `waypoints/` | Device configuration and waypoint dumps |
//! | `ghash/cache.db` | Geocode, waypoint and topic-to-tid cache (SQLite, WAL) |
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`ingest`]: Per-message pipeline behind [`ingest::Recorder`]
//! - [`storage`]: Log partitions, bounded scans, output formats and snapshots
//! - [`cache`]: Keyed cache tables and the geocode lookup policy
//! - [`fences`]: Waypoint enter/leave detection
//! - [`geo`]: Geohash encoding and reverse-geocoder providers
//! - [`server`] and [`transport`]: HTTP and MQTT front-ends

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod fences;
pub mod geo;
pub mod ingest;
pub mod server;
pub mod storage;
pub mod transport;
