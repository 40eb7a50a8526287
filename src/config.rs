use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RecorderConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub mqtt: MqttConfig,
    pub geocode: GeocodeConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
    pub http_host: String,
    /// 0 disables the HTTP listener.
    pub http_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the on-disk layout (`rec/`, `last/`, `cards/`, `ghash/`, ...).
    pub dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topics: Vec<String>,
    pub qos: u8,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GeocodeConfig {
    /// `none`, `nominatim`, or `opencage`.
    pub provider: String,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    /// Seconds after which a cached entry is refetched; 0 never expires.
    pub max_age_secs: i64,
    pub precision: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub ignore_retained: bool,
    pub skip_demo: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            http_host: "127.0.0.1".into(),
            http_port: 8083,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_trackstore_dir()
            .join("store")
            .to_string_lossy()
            .into_owned();
        Self { dir }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".into(),
            port: 1883,
            client_id: "trackstore".into(),
            username: None,
            password: None,
            topics: vec!["owntracks/#".into()],
            qos: 2,
        }
    }
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            provider: "none".into(),
            url: None,
            api_key: None,
            timeout_ms: 3000,
            max_age_secs: 0,
            precision: 7,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            ignore_retained: true,
            skip_demo: false,
        }
    }
}

impl GeocodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Returns `~/.trackstore/`, or `./.trackstore` when no home directory is known.
pub fn default_trackstore_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trackstore")
}

/// Returns the default config file path: `~/.trackstore/config.toml`
pub fn default_config_path() -> PathBuf {
    default_trackstore_dir().join("config.toml")
}

impl RecorderConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            RecorderConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (TRACKSTORE_STORAGE, TRACKSTORE_LOG_LEVEL,
    /// TRACKSTORE_GEOCODER, TRACKSTORE_MQTT_HOST).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TRACKSTORE_STORAGE") {
            self.storage.dir = val;
        }
        if let Ok(val) = std::env::var("TRACKSTORE_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("TRACKSTORE_GEOCODER") {
            self.geocode.provider = val;
        }
        if let Ok(val) = std::env::var("TRACKSTORE_MQTT_HOST") {
            self.mqtt.host = val;
            self.mqtt.enabled = true;
        }
    }

    /// Resolve the storage root, expanding `~` if needed.
    pub fn resolved_storage_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.dir)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RecorderConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.server.http_port, 8083);
        assert_eq!(config.geocode.provider, "none");
        assert_eq!(config.geocode.precision, 7);
        assert!(config.ingest.ignore_retained);
        assert!(config.storage.dir.ends_with("store"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
dir = "/tmp/otr"

[geocode]
provider = "nominatim"
max_age_secs = 86400

[mqtt]
enabled = true
topics = ["owntracks/+/+", "owntracks/+/+/event"]
"#;
        let config: RecorderConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.dir, "/tmp/otr");
        assert_eq!(config.geocode.provider, "nominatim");
        assert_eq!(config.geocode.max_age_secs, 86400);
        assert_eq!(config.mqtt.topics.len(), 2);
        // defaults still apply for unset fields
        assert_eq!(config.geocode.precision, 7);
        assert_eq!(config.mqtt.port, 1883);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = RecorderConfig::default();
        std::env::set_var("TRACKSTORE_STORAGE", "/tmp/override");
        std::env::set_var("TRACKSTORE_LOG_LEVEL", "trace");
        std::env::set_var("TRACKSTORE_GEOCODER", "opencage");

        config.apply_env_overrides();

        assert_eq!(config.storage.dir, "/tmp/override");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.geocode.provider, "opencage");

        // Clean up
        std::env::remove_var("TRACKSTORE_STORAGE");
        std::env::remove_var("TRACKSTORE_LOG_LEVEL");
        std::env::remove_var("TRACKSTORE_GEOCODER");
    }

    #[test]
    fn tilde_expansion_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/spool/rec"), PathBuf::from("/var/spool/rec"));
    }
}
