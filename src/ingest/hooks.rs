//! Collaborator seams of the ingest pipeline: event notification and payload
//! decryption.

use serde_json::{Map, Value};

use crate::error::{RecorderError, Result};
use crate::fences::Transition;
use crate::ingest::classify::PayloadKind;

/// Receives every accepted event and every geofence transition.
///
/// Implementations must not block for long; failures are theirs to log.
pub trait Notifier: Send + Sync {
    fn event(&self, topic: &str, kind: PayloadKind, record: &Map<String, Value>);

    fn transition(&self, topic: &str, transition: &Transition);
}

/// Notifier that writes one structured log line per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn event(&self, topic: &str, kind: PayloadKind, record: &Map<String, Value>) {
        let text = |k: &str| record.get(k).and_then(Value::as_str).unwrap_or_default();
        let num = |k: &str| record.get(k).and_then(Value::as_f64);
        tracing::info!(
            topic,
            %kind,
            tid = text("tid"),
            lat = num("lat"),
            lon = num("lon"),
            cc = text("cc"),
            addr = text("addr"),
            "event"
        );
    }

    fn transition(&self, topic: &str, t: &Transition) {
        tracing::info!(
            topic,
            event = %t.event,
            desc = %t.desc,
            dist = t.dist,
            "geofence"
        );
    }
}

/// Input to [`Decryptor::decrypt`].
#[derive(Debug, Clone)]
pub struct DecryptRequest<'a> {
    pub topic: &'a str,
    /// The payload's `data` member, base64.
    pub ciphertext_b64: &'a str,
    pub user: &'a str,
    pub device: &'a str,
    /// Lookup key for the shared secret, see [`decryption_key_id`].
    pub key_id: String,
}

/// Symmetric decryption of `encrypted` payloads.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, req: &DecryptRequest<'_>) -> Result<Vec<u8>>;
}

/// Rejects every request; encrypted payloads are then stored raw.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDecryption;

impl Decryptor for NoDecryption {
    fn decrypt(&self, req: &DecryptRequest<'_>) -> Result<Vec<u8>> {
        Err(RecorderError::Decrypt(format!("no key configured for {}", req.key_id)))
    }
}

/// `<user>-<device>`, lower-cased, with spaces replaced by `-`.
pub fn decryption_key_id(user: &str, device: &str) -> String {
    format!("{user}-{device}").to_lowercase().replace(' ', "-")
}
