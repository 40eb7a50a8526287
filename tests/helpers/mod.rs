#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use trackstore::cache::Cache;
use trackstore::config::RecorderConfig;
use trackstore::error::{RecorderError, Result};
use trackstore::fences::Transition;
use trackstore::geo::revgeo::{GeoInfo, ReverseGeocoder};
use trackstore::ingest::classify::PayloadKind;
use trackstore::ingest::hooks::{DecryptRequest, Decryptor, Notifier};
use trackstore::ingest::Recorder;
use trackstore::storage::StorageLayout;

/// 2023-11-14T22:13:20Z
pub const T0: i64 = 1_700_000_000;

/// Config rooted at `dir`, no geocoder, no MQTT.
pub fn test_config(dir: &TempDir) -> RecorderConfig {
    let mut config = RecorderConfig::default();
    config.storage.dir = dir.path().to_string_lossy().into_owned();
    config
}

/// A recorder over a fresh temp directory and an in-memory cache.
pub fn test_recorder() -> (TempDir, Recorder) {
    recorder_with(None)
}

pub fn recorder_with(geocoder: Option<Box<dyn ReverseGeocoder>>) -> (TempDir, Recorder) {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let cache = Arc::new(Cache::in_memory().unwrap());
    let recorder = Recorder::with_cache(&config, StorageLayout::new(dir.path()), cache, geocoder);
    (dir, recorder)
}

/// A location payload as a tracker would publish it.
pub fn location(tst: i64, lat: f64, lon: f64) -> String {
    json!({"_type": "location", "tid": "JP", "tst": tst, "lat": lat, "lon": lon, "acc": 10, "batt": 80})
        .to_string()
}

/// Latitude `meters` north of `lat` along a meridian.
pub fn north(lat: f64, meters: f64) -> f64 {
    lat + meters / 111_195.0
}

pub fn object(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        other => panic!("not an object: {other}"),
    }
}

/// Geocoder answering every lookup with the same address and counting calls.
pub struct StaticGeocoder {
    pub info: GeoInfo,
    pub calls: Arc<AtomicUsize>,
}

impl StaticGeocoder {
    pub fn new(cc: &str, addr: &str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let geocoder = Self {
            info: GeoInfo {
                cc: cc.to_string(),
                addr: Some(addr.to_string()),
                locality: Some("Testville".to_string()),
                tzname: None,
            },
            calls: calls.clone(),
        };
        (geocoder, calls)
    }
}

impl ReverseGeocoder for StaticGeocoder {
    fn reverse(&self, _lat: f64, _lon: f64, _timeout: Duration) -> Result<GeoInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.info.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Geocoder that is always down.
pub struct FailingGeocoder;

impl ReverseGeocoder for FailingGeocoder {
    fn reverse(&self, _lat: f64, _lon: f64, _timeout: Duration) -> Result<GeoInfo> {
        Err(RecorderError::UpstreamGeocode("over quota".into()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// "Decrypts" by base64-decoding the ciphertext.
pub struct Base64Decryptor;

impl Decryptor for Base64Decryptor {
    fn decrypt(&self, req: &DecryptRequest<'_>) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(req.ciphertext_b64)
            .map_err(|e| RecorderError::Decrypt(e.to_string()))
    }
}

pub fn encrypted(clear: &str) -> String {
    let data = base64::engine::general_purpose::STANDARD.encode(clear);
    json!({"_type": "encrypted", "data": data}).to_string()
}

/// Notifier that keeps everything it is told.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub events: Arc<Mutex<Vec<(String, PayloadKind)>>>,
    pub transitions: Arc<Mutex<Vec<Transition>>>,
}

impl Notifier for RecordingNotifier {
    fn event(&self, topic: &str, kind: PayloadKind, _record: &Map<String, Value>) {
        self.events.lock().unwrap().push((topic.to_string(), kind));
    }

    fn transition(&self, _topic: &str, transition: &Transition) {
        self.transitions.lock().unwrap().push(transition.clone());
    }
}
