//! Reverse-geocoding providers.
//!
//! Provides the [`ReverseGeocoder`] trait and HTTP implementations for
//! Nominatim and OpenCage. The provider is created via [`create_geocoder`]
//! from configuration; `"none"` yields no provider and disables lookups.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::GeocodeConfig;
use crate::error::{RecorderError, Result};

const USER_AGENT: &str = concat!("trackstore/", env!("CARGO_PKG_VERSION"));
const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/reverse";
const OPENCAGE_URL: &str = "https://api.opencagedata.com/geocode/v1/json";

/// What a provider knows about a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub cc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tzname: Option<String>,
}

/// Maps coordinates to an address.
///
/// Implementations do blocking network I/O and must give up after `timeout`.
/// Callers in async contexts should use `tokio::task::spawn_blocking`.
pub trait ReverseGeocoder: Send + Sync {
    fn reverse(&self, lat: f64, lon: f64, timeout: Duration) -> Result<GeoInfo>;

    /// Short provider name for logs.
    fn name(&self) -> &'static str;
}

/// Create a reverse geocoder from config. Returns `Ok(None)` for `"none"`.
pub fn create_geocoder(config: &GeocodeConfig) -> anyhow::Result<Option<Box<dyn ReverseGeocoder>>> {
    match config.provider.as_str() {
        "none" | "" => Ok(None),
        "nominatim" => {
            let url = config.url.clone().unwrap_or_else(|| NOMINATIM_URL.to_string());
            Ok(Some(Box::new(NominatimGeocoder::new(url)?)))
        }
        "opencage" => {
            let Some(key) = config.api_key.clone() else {
                anyhow::bail!("geocode provider opencage requires geocode.api_key");
            };
            let url = config.url.clone().unwrap_or_else(|| OPENCAGE_URL.to_string());
            Ok(Some(Box::new(OpenCageGeocoder::new(url, key)?)))
        }
        other => anyhow::bail!(
            "unknown geocode provider: {other}. Supported: none, nominatim, opencage"
        ),
    }
}

fn http_client() -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .build()?)
}

fn fetch_json(req: reqwest::blocking::RequestBuilder, timeout: Duration) -> Result<Value> {
    let response = req
        .timeout(timeout)
        .send()
        .map_err(|e| RecorderError::UpstreamGeocode(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(RecorderError::UpstreamGeocode(format!("HTTP {status}")));
    }
    response
        .json::<Value>()
        .map_err(|e| RecorderError::UpstreamGeocode(e.to_string()))
}

fn first_str(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// OpenStreetMap Nominatim (`format=jsonv2`).
pub struct NominatimGeocoder {
    client: reqwest::blocking::Client,
    url: String,
}

impl NominatimGeocoder {
    pub fn new(url: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            url,
        })
    }
}

/// Decode a Nominatim reverse response.
pub fn parse_nominatim(body: &Value) -> Result<GeoInfo> {
    if let Some(err) = body.get("error").and_then(Value::as_str) {
        return Err(RecorderError::UpstreamGeocode(err.to_string()));
    }
    let address = body.get("address").cloned().unwrap_or(Value::Null);
    let cc = address
        .get("country_code")
        .and_then(Value::as_str)
        .map(str::to_uppercase)
        .unwrap_or_else(|| "??".to_string());

    Ok(GeoInfo {
        cc,
        addr: first_str(body, &["display_name"]),
        locality: first_str(&address, &["city", "town", "village", "hamlet", "municipality"]),
        tzname: None,
    })
}

impl ReverseGeocoder for NominatimGeocoder {
    fn reverse(&self, lat: f64, lon: f64, timeout: Duration) -> Result<GeoInfo> {
        let req = self.client.get(&self.url).query(&[
            ("format", "jsonv2".to_string()),
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("addressdetails", "1".to_string()),
        ]);
        parse_nominatim(&fetch_json(req, timeout)?)
    }

    fn name(&self) -> &'static str {
        "nominatim"
    }
}

/// OpenCage geocoder; needs an API key.
pub struct OpenCageGeocoder {
    client: reqwest::blocking::Client,
    url: String,
    key: String,
}

impl OpenCageGeocoder {
    pub fn new(url: String, key: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client()?,
            url,
            key,
        })
    }
}

/// Decode an OpenCage response. Quota exhaustion shows up as a non-200 `status.code`.
pub fn parse_opencage(body: &Value) -> Result<GeoInfo> {
    let code = body
        .pointer("/status/code")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if code != 200 {
        let message = body
            .pointer("/status/message")
            .and_then(Value::as_str)
            .unwrap_or("unknown status");
        return Err(RecorderError::UpstreamGeocode(format!("{code}: {message}")));
    }

    let Some(first) = body.pointer("/results/0") else {
        return Err(RecorderError::UpstreamGeocode("no results".into()));
    };
    let components = first.get("components").cloned().unwrap_or(Value::Null);

    Ok(GeoInfo {
        cc: first_str(&components, &["ISO_3166-1_alpha-2", "country_code"])
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "??".to_string()),
        addr: first_str(first, &["formatted"]),
        locality: first_str(&components, &["city", "town", "village", "hamlet"]),
        tzname: first
            .pointer("/annotations/timezone/name")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

impl ReverseGeocoder for OpenCageGeocoder {
    fn reverse(&self, lat: f64, lon: f64, timeout: Duration) -> Result<GeoInfo> {
        let req = self.client.get(&self.url).query(&[
            ("q", format!("{lat}+{lon}")),
            ("key", self.key.clone()),
            ("no_record", "1".to_string()),
        ]);
        parse_opencage(&fetch_json(req, timeout)?)
    }

    fn name(&self) -> &'static str {
        "opencage"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nominatim_response_is_decoded() {
        let body = json!({
            "display_name": "Dam, Amsterdam, Noord-Holland, Nederland",
            "address": {"city": "Amsterdam", "country_code": "nl"}
        });
        let info = parse_nominatim(&body).unwrap();
        assert_eq!(info.cc, "NL");
        assert_eq!(info.locality.as_deref(), Some("Amsterdam"));
        assert!(info.addr.unwrap().starts_with("Dam"));
    }

    #[test]
    fn nominatim_error_is_upstream_failure() {
        let body = json!({"error": "Unable to geocode"});
        assert!(matches!(
            parse_nominatim(&body),
            Err(RecorderError::UpstreamGeocode(_))
        ));
    }

    #[test]
    fn opencage_response_is_decoded() {
        let body = json!({
            "status": {"code": 200, "message": "OK"},
            "results": [{
                "formatted": "Hauptstr. 1, 10115 Berlin, Germany",
                "components": {"ISO_3166-1_alpha-2": "DE", "city": "Berlin"},
                "annotations": {"timezone": {"name": "Europe/Berlin"}}
            }]
        });
        let info = parse_opencage(&body).unwrap();
        assert_eq!(info.cc, "DE");
        assert_eq!(info.tzname.as_deref(), Some("Europe/Berlin"));
        assert_eq!(info.locality.as_deref(), Some("Berlin"));
    }

    #[test]
    fn opencage_quota_is_upstream_failure() {
        let body = json!({"status": {"code": 402, "message": "quota exceeded"}, "results": []});
        assert!(parse_opencage(&body).is_err());
    }

    #[test]
    fn none_provider_disables_lookups() {
        let config = GeocodeConfig::default();
        assert!(create_geocoder(&config).unwrap().is_none());
    }

    #[test]
    fn opencage_without_key_is_rejected() {
        let config = GeocodeConfig {
            provider: "opencage".into(),
            ..GeocodeConfig::default()
        };
        assert!(create_geocoder(&config).is_err());
    }
}
