//! Error taxonomy for the recorder core.
//!
//! Every per-event failure is contained to that event: the ingest pipeline logs
//! these and degrades (raw storage, cache miss, missing geo data) instead of
//! propagating them. Only [`RecorderError::ConfigurationFatal`] stops startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    /// Payload is neither JSON nor a recognised CSV line.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Cache environment or transaction failure; callers treat it as a miss.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Reverse-geocode provider failed, timed out, or is over quota.
    #[error("reverse geocode failed: {0}")]
    UpstreamGeocode(String),

    /// Directory or file I/O failed while persisting an event.
    #[error("storage write failed for {path}: {source}")]
    StorageWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Cannot open the primary cache at startup.
    #[error("fatal configuration error: {0}")]
    ConfigurationFatal(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    /// Bad query window, output format, or user/device selector.
    #[error("invalid query: {0}")]
    Query(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RecorderError {
    pub(crate) fn storage(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::StorageWrite {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<rusqlite::Error> for RecorderError {
    fn from(e: rusqlite::Error) -> Self {
        Self::CacheUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
