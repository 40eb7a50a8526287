//! Last-known-state documents.
//!
//! One JSON document per `(user, device)`, replaced atomically on every
//! accepted location. Reads merge in the device's card and the cached
//! reverse-geocode data for the stored geohash.

use std::fs;

use serde_json::{Map, Value};

use crate::cache::geocode::GeocodeEntry;
use crate::cache::{Cache, Table};
use crate::error::Result;
use crate::storage::query::merge_geo;
use crate::storage::{list_subdirs, safewrite, StorageLayout};

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    layout: StorageLayout,
}

impl SnapshotStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Replace the snapshot of `(user, device)` with `record`.
    pub fn put_snapshot(&self, user: &str, device: &str, record: &Value) -> Result<()> {
        let body = serde_json::to_vec(record)?;
        safewrite(&self.layout.snapshot(user, device), &body)
    }

    /// Every `(user, device)` with a snapshot directory, sorted.
    pub fn list_users_devices(&self) -> Result<Vec<(String, String)>> {
        let root = self.layout.last_root();
        let mut out = Vec::new();
        for user in list_subdirs(&root)? {
            for device in list_subdirs(&root.join(&user))? {
                out.push((user.clone(), device));
            }
        }
        Ok(out)
    }

    fn read_object(path: &std::path::Path) -> Option<Map<String, Value>> {
        let text = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&text) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot decode stored JSON");
                None
            }
        }
    }

    /// Card for `(user, device)`, falling back to the user-wide card.
    pub fn card(&self, user: &str, device: &str) -> Option<Map<String, Value>> {
        Self::read_object(&self.layout.card(user, device))
            .or_else(|| Self::read_object(&self.layout.user_card(user)))
    }

    /// The stored snapshot merged with card `name`/`face` and cached geo data.
    pub fn get_snapshot(&self, user: &str, device: &str, cache: Option<&Cache>) -> Option<Map<String, Value>> {
        let mut o = Self::read_object(&self.layout.snapshot(user, device))?;

        if let Some(card) = self.card(user, device) {
            for key in ["name", "face"] {
                if let Some(v) = card.get(key) {
                    o.insert(key.to_string(), v.clone());
                }
            }
        }

        let ghash = o.get("ghash").and_then(Value::as_str).map(String::from);
        if let (Some(cache), Some(ghash)) = (cache, ghash) {
            if let Some(entry) = cache.get_json::<GeocodeEntry>(Table::Geocode, &ghash) {
                merge_geo(&mut o, &entry);
            }
        }
        Some(o)
    }

    /// All merged snapshots, optionally restricted to one user and device and
    /// projected onto `fields`.
    pub fn last(
        &self,
        cache: Option<&Cache>,
        user: Option<&str>,
        device: Option<&str>,
        fields: Option<&[String]>,
    ) -> Result<Vec<Value>> {
        let user = user.map(super::sanitize);
        let device = device.map(super::sanitize);

        let mut out = Vec::new();
        for (u, d) in self.list_users_devices()? {
            if user.as_ref().is_some_and(|want| *want != u) || device.as_ref().is_some_and(|want| *want != d) {
                continue;
            }
            let Some(snapshot) = self.get_snapshot(&u, &d, cache) else {
                continue;
            };
            let snapshot = match fields {
                Some(fields) => fields
                    .iter()
                    .filter_map(|f| snapshot.get(f).map(|v| (f.clone(), v.clone())))
                    .collect(),
                None => snapshot,
            };
            out.push(Value::Object(snapshot));
        }
        Ok(out)
    }

    /// Remove the snapshot of `(user, device)`. Returns `true` if one existed.
    pub fn remove(&self, user: &str, device: &str) -> Result<bool> {
        let path = self.layout.snapshot(user, device);
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(dir) = path.parent() {
                    let _ = fs::remove_dir(dir);
                }
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(crate::error::RecorderError::storage(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(StorageLayout::new(tmp.path()));
        (tmp, store)
    }

    #[test]
    fn put_then_list() {
        let (_tmp, store) = store();
        store.put_snapshot("jane", "phone", &json!({"lat": 1.0})).unwrap();
        store.put_snapshot("bob", "tab", &json!({"lat": 2.0})).unwrap();

        assert_eq!(
            store.list_users_devices().unwrap(),
            vec![("bob".to_string(), "tab".to_string()), ("jane".to_string(), "phone".to_string())]
        );
    }

    #[test]
    fn merge_card_and_geo() {
        let (tmp, store) = store();
        store
            .put_snapshot("jane", "phone", &json!({"lat": 52.0, "lon": 5.0, "ghash": "u15xcf2"}))
            .unwrap();
        let card = tmp.path().join("cards").join("jane").join("jane.json");
        fs::create_dir_all(card.parent().unwrap()).unwrap();
        fs::write(&card, r#"{"_type":"card","name":"Jane Jolie","face":"AAAA"}"#).unwrap();

        let cache = Cache::in_memory().unwrap();
        cache.put(Table::Geocode, "u15xcf2", r#"{"cc":"NL","addr":"Dorpstraat 1","tst":5}"#);

        let merged = store.get_snapshot("jane", "phone", Some(&cache)).unwrap();
        assert_eq!(merged["name"], "Jane Jolie");
        assert_eq!(merged["face"], "AAAA");
        assert_eq!(merged["cc"], "NL");
        assert_eq!(merged["addr"], "Dorpstraat 1");
    }

    #[test]
    fn last_filters_and_projects() {
        let (_tmp, store) = store();
        store.put_snapshot("jane", "phone", &json!({"tid": "JP", "lat": 1.0})).unwrap();
        store.put_snapshot("jane", "tab", &json!({"tid": "JT", "lat": 2.0})).unwrap();

        let all = store.last(None, Some("Jane"), None, None).unwrap();
        assert_eq!(all.len(), 2);

        let one = store
            .last(None, Some("jane"), Some("tab"), Some(&["tid".to_string()]))
            .unwrap();
        assert_eq!(one, vec![json!({"tid": "JT"})]);
    }
}
