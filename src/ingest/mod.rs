//! Ingest pipeline: topic parsing, payload classification, enrichment and
//! persistence of one inbound message.
//!
//! [`Recorder`] owns everything an event touches (cache, log, snapshot store,
//! geocoder, decryptor, notifier) and is shared by the transports behind an
//! `Arc`. [`Recorder::handle`] never fails: per-event problems are logged
//! and the payload degrades to raw storage.

pub mod classify;
pub mod hooks;
pub mod locks;
pub mod topic;

use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use serde_json::{Map, Value};

use crate::cache::geocode::{self, GeoSource, GeocodePolicy};
use crate::cache::{Cache, Table};
use crate::config::{IngestConfig, RecorderConfig};
use crate::fences::{self, Transition};
use crate::geo::geohash_encode;
use crate::geo::revgeo::{create_geocoder, ReverseGeocoder};
use crate::storage::log::LogStore;
use crate::storage::query::Scanner;
use crate::storage::snapshot::SnapshotStore;
use crate::storage::{isotime, safewrite, write_file, StorageLayout};

use classify::{classify, normalize, Classified, PayloadKind};
use hooks::{decryption_key_id, DecryptRequest, Decryptor, LogNotifier, NoDecryption, Notifier};
use locks::DeviceLocks;
use topic::{parse_topic, TopicParts};

/// One message as delivered by a transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    EmptyPayload,
    Retained,
    ShortTopic,
    Demo,
}

/// What happened to a message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Ignored(IgnoreReason),
    /// Appended to the log verbatim. `None` when the payload could not be
    /// decoded at all.
    Logged { kind: Option<PayloadKind> },
    Card,
    Waypoints { loaded: usize },
    ConfigDump,
    /// A location, waypoint or transition went through enrichment.
    Located {
        kind: PayloadKind,
        tst: i64,
        ghash: String,
        geo: GeoSource,
        transitions: Vec<Transition>,
    },
    /// Location-like payload without a usable position; logged raw.
    Rejected(String),
    /// Persisting the event failed; it was dropped.
    Failed(String),
}

pub struct Recorder {
    layout: StorageLayout,
    cache: Arc<Cache>,
    log: LogStore,
    snapshots: SnapshotStore,
    geocoder: Option<Box<dyn ReverseGeocoder>>,
    decryptor: Box<dyn Decryptor>,
    notifier: Box<dyn Notifier>,
    locks: DeviceLocks,
    policy: GeocodePolicy,
    precision: usize,
    options: IngestConfig,
}

impl Recorder {
    /// Open the store described by `config`. Fails if the cache cannot be
    /// opened or the geocoder is misconfigured.
    pub fn open(config: &RecorderConfig) -> anyhow::Result<Self> {
        let layout = StorageLayout::new(config.resolved_storage_dir());
        let cache = Cache::open(layout.cache_db()).context("cannot open cache")?;
        let geocoder = create_geocoder(&config.geocode)?;
        Ok(Self::with_cache(config, layout, Arc::new(cache), geocoder))
    }

    /// Assemble a recorder from already-opened parts.
    pub fn with_cache(
        config: &RecorderConfig,
        layout: StorageLayout,
        cache: Arc<Cache>,
        geocoder: Option<Box<dyn ReverseGeocoder>>,
    ) -> Self {
        tracing::info!(
            root = %layout.root().display(),
            geocoder = geocoder.as_ref().map(|g| g.name()).unwrap_or("none"),
            "recorder ready"
        );
        Self {
            log: LogStore::new(layout.clone()),
            snapshots: SnapshotStore::new(layout.clone()),
            layout,
            cache,
            geocoder,
            decryptor: Box::new(NoDecryption),
            notifier: Box::new(LogNotifier),
            locks: DeviceLocks::new(),
            policy: GeocodePolicy {
                max_age_secs: config.geocode.max_age_secs,
                timeout: config.geocode.timeout(),
            },
            precision: config.geocode.precision,
            options: config.ingest.clone(),
        }
    }

    pub fn with_decryptor(mut self, decryptor: impl Decryptor + 'static) -> Self {
        self.decryptor = Box::new(decryptor);
        self
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn log(&self) -> &LogStore {
        &self.log
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn precision(&self) -> usize {
        self.precision
    }

    /// Query access to the log, enriched from this recorder's cache.
    pub fn scanner(&self) -> Scanner<'_> {
        Scanner::new(&self.log, Some(&self.cache), self.precision)
    }

    /// Process one message received now.
    pub fn handle(&self, msg: &InboundMessage) -> IngestOutcome {
        self.handle_at(msg, chrono::Utc::now().timestamp())
    }

    /// Process one message with `now` as its receive time.
    pub fn handle_at(&self, msg: &InboundMessage, now: i64) -> IngestOutcome {
        if msg.payload.is_empty() {
            return IngestOutcome::Ignored(IgnoreReason::EmptyPayload);
        }
        if msg.retained && self.options.ignore_retained {
            tracing::debug!(topic = %msg.topic, "skipping retained message");
            return IngestOutcome::Ignored(IgnoreReason::Retained);
        }
        let Some(parts) = parse_topic(&msg.topic) else {
            tracing::warn!(topic = %msg.topic, "ignoring short topic");
            return IngestOutcome::Ignored(IgnoreReason::ShortTopic);
        };

        self.locks.with_device(&parts.user, &parts.device, || {
            let event = Event {
                topic: &msg.topic,
                parts: &parts,
                now,
            };
            self.dispatch(&event, &msg.payload, classify(&msg.payload), false)
        })
    }

    fn dispatch(&self, ev: &Event<'_>, raw: &[u8], classified: Classified, was_encrypted: bool) -> IngestOutcome {
        let (kind, mut body) = match classified {
            Classified::Raw(bytes) => {
                tracing::debug!(topic = ev.topic, "payload is neither JSON nor CSV");
                return self.log_verbatim(ev, &bytes, None);
            }
            Classified::Payload { kind, body, .. } => (kind, body),
        };

        if self.options.skip_demo && body.contains_key("_demo") {
            return IngestOutcome::Ignored(IgnoreReason::Demo);
        }

        let outcome = match kind {
            PayloadKind::Encrypted if !was_encrypted => return self.decrypt(ev, raw, &body),
            PayloadKind::Encrypted => {
                tracing::warn!(topic = ev.topic, "nested encrypted payload treated as unknown");
                self.log_verbatim(ev, raw, Some(PayloadKind::Unknown))
            }
            PayloadKind::Card => self.store_card(ev, &body),
            PayloadKind::Waypoints => self.store_waypoints(ev, &body),
            PayloadKind::Dump => self.store_config_dump(ev, &body),
            PayloadKind::Cmd
            | PayloadKind::Steps
            | PayloadKind::Lwt
            | PayloadKind::Beacon
            | PayloadKind::Request
            | PayloadKind::Unknown => self.log_verbatim(ev, raw, Some(kind)),
            PayloadKind::Location | PayloadKind::Waypoint | PayloadKind::Transition => {
                return self.locate(ev, raw, kind, body);
            }
        };

        if !matches!(outcome, IngestOutcome::Failed(_)) {
            body.insert("topic".into(), ev.topic.into());
            self.notifier.event(ev.topic, kind, &body);
        }
        outcome
    }

    fn log_verbatim(&self, ev: &Event<'_>, payload: &[u8], kind: Option<PayloadKind>) -> IngestOutcome {
        let p = ev.parts;
        match self.log.append(&p.user, &p.device, ev.now, &p.reltopic, payload) {
            Ok(_) => IngestOutcome::Logged { kind },
            Err(e) => {
                tracing::error!(topic = ev.topic, error = %e, "cannot record payload");
                IngestOutcome::Failed(e.to_string())
            }
        }
    }

    fn decrypt(&self, ev: &Event<'_>, raw: &[u8], body: &Map<String, Value>) -> IngestOutcome {
        let p = ev.parts;
        let Some(data) = body.get("data").and_then(Value::as_str) else {
            tracing::warn!(topic = ev.topic, "encrypted payload without data");
            return self.log_verbatim(ev, raw, Some(PayloadKind::Encrypted));
        };

        let req = DecryptRequest {
            topic: ev.topic,
            ciphertext_b64: data,
            user: &p.user,
            device: &p.device,
            key_id: decryption_key_id(&p.user, &p.device),
        };
        match self.decryptor.decrypt(&req) {
            Ok(clear) => self.dispatch(ev, &clear, classify(&clear), true),
            Err(e) => {
                tracing::warn!(topic = ev.topic, key_id = %req.key_id, error = %e, "cannot decrypt payload");
                self.log_verbatim(ev, raw, Some(PayloadKind::Encrypted))
            }
        }
    }

    fn store_pretty(&self, path: &std::path::Path, body: &Map<String, Value>) -> crate::error::Result<()> {
        let pretty = serde_json::to_vec_pretty(body)?;
        safewrite(path, &pretty)
    }

    fn store_card(&self, ev: &Event<'_>, body: &Map<String, Value>) -> IngestOutcome {
        let p = ev.parts;
        if let Err(e) = self.store_pretty(&self.layout.card(&p.user, &p.device), body) {
            tracing::error!(topic = ev.topic, error = %e, "cannot store card");
            return IngestOutcome::Failed(e.to_string());
        }

        if let Some(face) = body.get("face").and_then(Value::as_str) {
            match base64::engine::general_purpose::STANDARD.decode(face.trim()) {
                Ok(img) => {
                    if let Err(e) = write_file(&self.layout.photo(&p.user, &p.device), &img) {
                        tracing::warn!(topic = ev.topic, error = %e, "cannot store avatar");
                    }
                }
                Err(e) => tracing::warn!(topic = ev.topic, error = %e, "card face is not base64"),
            }
        }
        IngestOutcome::Card
    }

    fn store_config_dump(&self, ev: &Event<'_>, body: &Map<String, Value>) -> IngestOutcome {
        let p = ev.parts;
        match self.store_pretty(&self.layout.config_dump(&p.user, &p.device), body) {
            Ok(()) => IngestOutcome::ConfigDump,
            Err(e) => {
                tracing::error!(topic = ev.topic, error = %e, "cannot store configuration dump");
                IngestOutcome::Failed(e.to_string())
            }
        }
    }

    fn store_waypoints(&self, ev: &Event<'_>, body: &Map<String, Value>) -> IngestOutcome {
        let p = ev.parts;
        let loaded = match body.get("waypoints") {
            Some(Value::Array(list)) => {
                fences::load_waypoints(&self.cache, &p.user, &p.device, list, self.precision)
            }
            _ => 0,
        };
        tracing::info!(user = %p.user, device = %p.device, loaded, "waypoints imported");

        match self.store_pretty(&self.layout.waypoints_dump(&p.user, &p.device), body) {
            Ok(()) => IngestOutcome::Waypoints { loaded },
            Err(e) => {
                tracing::error!(topic = ev.topic, error = %e, "cannot store waypoints dump");
                IngestOutcome::Failed(e.to_string())
            }
        }
    }

    /// Enrichment path for location, waypoint and transition payloads.
    fn locate(&self, ev: &Event<'_>, raw: &[u8], kind: PayloadKind, mut body: Map<String, Value>) -> IngestOutcome {
        let p = ev.parts;

        let pos = match normalize(&mut body, ev.now) {
            Ok(pos) => pos,
            Err(e) => {
                tracing::error!(topic = ev.topic, error = %e, "rejecting {kind} payload");
                return match self.log_verbatim(ev, raw, Some(kind)) {
                    IngestOutcome::Failed(f) => IngestOutcome::Failed(f),
                    _ => IngestOutcome::Rejected(e.to_string()),
                };
            }
        };

        if kind == PayloadKind::Location {
            if let Some(tid) = self.cache.get(Table::TopicToTid, ev.topic) {
                body.insert("tid".into(), Value::String(tid));
            }
        }

        let ghash = geohash_encode(pos.lat, pos.lon, self.precision);
        let missing = self.layout.missing_ghash();
        let resolution = geocode::resolve(
            &self.cache,
            self.geocoder.as_deref(),
            self.policy,
            Some(&missing),
            &ghash,
            pos.lat,
            pos.lon,
            ev.now,
        );

        let compact = match serde_json::to_vec(&body) {
            Ok(v) => v,
            Err(e) => return IngestOutcome::Failed(e.to_string()),
        };
        if let Err(e) = self.log.append(&p.user, &p.device, pos.tst, &p.reltopic, &compact) {
            tracing::error!(topic = ev.topic, error = %e, "cannot record {kind}");
            return IngestOutcome::Failed(e.to_string());
        }

        body.insert("topic".into(), ev.topic.into());
        body.insert("username".into(), p.user.as_str().into());
        body.insert("device".into(), p.device.as_str().into());
        body.insert("ghash".into(), ghash.as_str().into());

        match kind {
            PayloadKind::Location => {
                if let Err(e) = self.snapshots.put_snapshot(&p.user, &p.device, &Value::Object(body.clone())) {
                    tracing::error!(topic = ev.topic, error = %e, "cannot write snapshot");
                }
            }
            PayloadKind::Waypoint => {
                let path = self.layout.waypoint_event(&p.user, &p.device, &isotime(pos.tst));
                let written = serde_json::to_vec(&body)
                    .map_err(crate::error::RecorderError::from)
                    .and_then(|js| safewrite(&path, &js));
                if let Err(e) = written {
                    tracing::error!(topic = ev.topic, error = %e, "cannot write waypoint");
                }
                if let Some(wp) = fences::waypoint_from_json(&Value::Object(body.clone())) {
                    fences::put_waypoint(&self.cache, &p.user, &p.device, wp, self.precision);
                }
            }
            _ => {}
        }

        let geo = resolution.geo;
        body.insert("cc".into(), geo.cc.into());
        for (key, value) in [("addr", geo.addr), ("locality", geo.locality), ("tzname", geo.tzname)] {
            if let Some(v) = value {
                body.insert(key.into(), v.into());
            }
        }

        let transitions = if kind == PayloadKind::Location {
            fences::check_fences(&self.cache, &p.user, &p.device, pos.lat, pos.lon)
        } else {
            Vec::new()
        };
        for t in &transitions {
            self.notifier.transition(ev.topic, t);
        }
        self.notifier.event(ev.topic, kind, &body);

        tracing::debug!(
            topic = ev.topic,
            %kind,
            tst = pos.tst,
            ghash = %ghash,
            cached = resolution.source == GeoSource::Cached,
            "event recorded"
        );

        IngestOutcome::Located {
            kind,
            tst: pos.tst,
            ghash,
            geo: resolution.source,
            transitions,
        }
    }
}

/// Per-message context threaded through dispatch.
struct Event<'a> {
    topic: &'a str,
    parts: &'a TopicParts,
    now: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (tempfile::TempDir, Recorder) {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = RecorderConfig::default();
        config.storage.dir = tmp.path().to_string_lossy().into_owned();
        let layout = StorageLayout::new(tmp.path());
        let rec = Recorder::with_cache(&config, layout, Arc::new(Cache::in_memory().unwrap()), None);
        (tmp, rec)
    }

    #[test]
    fn empty_and_retained_are_ignored() {
        let (_tmp, rec) = recorder();
        let empty = InboundMessage::new("owntracks/jane/phone", Vec::new());
        assert_eq!(rec.handle(&empty), IngestOutcome::Ignored(IgnoreReason::EmptyPayload));

        let mut retained = InboundMessage::new("owntracks/jane/phone", "{}");
        retained.retained = true;
        assert_eq!(rec.handle(&retained), IngestOutcome::Ignored(IgnoreReason::Retained));
    }

    #[test]
    fn short_topic_is_ignored() {
        let (_tmp, rec) = recorder();
        let msg = InboundMessage::new("owntracks/jane", "{}");
        assert_eq!(rec.handle(&msg), IngestOutcome::Ignored(IgnoreReason::ShortTopic));
    }

    #[test]
    fn topic_override_replaces_tid() {
        let (_tmp, rec) = recorder();
        rec.cache().put(Table::TopicToTid, "owntracks/jane/phone", "ZZ");
        let msg = InboundMessage::new(
            "owntracks/jane/phone",
            r#"{"_type":"location","tid":"JP","lat":52.0,"lon":5.0,"tst":1700000000}"#,
        );
        assert!(matches!(rec.handle_at(&msg, 1_700_000_100), IngestOutcome::Located { .. }));

        let snap = rec.snapshots().get_snapshot("jane", "phone", None).unwrap();
        assert_eq!(snap["tid"], "ZZ");
    }
}
