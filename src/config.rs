//! Hub configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tunables shared by the registries, the content store and the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Items newer than this are excluded from stable queries.
    /// Default: 5000
    pub settle_window_ms: u64,

    /// How long a cached channel config may be served.
    /// Default: 60000
    pub channel_cache_ttl_ms: u64,

    /// Entries per cache (spread across stripes).
    pub channel_cache_capacity: usize,

    /// Independent cache stripes.
    pub channel_cache_stripes: usize,

    /// Keys fetched from the backend per scan page.
    pub scan_page_size: usize,

    /// Deadline applied to every coordinator operation (None = wait forever).
    pub request_timeout_ms: Option<u64>,

    /// Attempts at a conditional write before giving up with `Conflict`.
    pub max_cas_retries: usize,

    /// Buffered events per group watcher before it is dropped.
    pub group_watch_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            settle_window_ms: 5_000,
            channel_cache_ttl_ms: 60_000,
            channel_cache_capacity: 1_000,
            channel_cache_stripes: 8,
            scan_page_size: 256,
            request_timeout_ms: None,
            max_cas_retries: 16,
            group_watch_buffer: 1_024,
        }
    }
}

impl HubConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn channel_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.channel_cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Where and how the file backend keeps its log.
#[derive(Clone, Debug)]
pub struct FileBackendConfig {
    /// Directory holding the log and lock file.
    pub path: PathBuf,

    /// fsync after every mutation.
    pub sync_every_write: bool,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./hub-data"),
            sync_every_write: true,
            create_if_missing: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = HubConfig::from_json(r#"{"settle_window_ms": 250, "request_timeout_ms": 40}"#)
            .unwrap();
        assert_eq!(config.settle_window(), Duration::from_millis(250));
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(40)));
        assert_eq!(config.scan_page_size, 256);
    }

    #[test]
    fn test_bad_json_is_an_error() {
        assert!(matches!(
            HubConfig::from_json("{not json"),
            Err(crate::HubError::Deserialization(_))
        ));
    }
}
