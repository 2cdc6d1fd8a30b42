//! Configuration for the stash service.
//!
//! Loaded from a JSON document with camelCase keys; every field has a
//! default so an empty object is a valid configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StashError};
use crate::persistence::{TrackStoreConfig, MIN_WRITE_INTERVAL_MS, TRACK_CUTOFF_INTERVAL_MS};

/// Connection settings for the InfluxDB time-series store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub protocol: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8086,
            database: "signalk".to_string(),
            protocol: "http".to_string(),
        }
    }
}

/// Whether the configured path list selects or excludes paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListMode {
    White,
    #[default]
    Black,
}

/// Decides which numeric paths are forwarded to the time-series store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    mode: ListMode,
    paths: HashSet<String>,
}

impl PathFilter {
    pub fn new(mode: ListMode, paths: impl IntoIterator<Item = String>) -> Self {
        Self {
            mode,
            paths: paths.into_iter().collect(),
        }
    }

    /// An empty list lets every path through regardless of mode.
    pub fn allows(&self, path: &str) -> bool {
        if self.paths.is_empty() {
            return true;
        }
        match self.mode {
            ListMode::White => self.paths.contains(path),
            ListMode::Black => !self.paths.contains(path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StashConfig {
    /// Identity of this vessel; deltas for `vessels.<selfId>` are ingested
    pub self_id: String,
    pub influx: InfluxConfig,
    pub black_or_white: ListMode,
    pub black_or_whitelist: Vec<String>,
    pub track_db_path: PathBuf,
    pub min_write_interval_ms: i64,
    pub track_cutoff_interval_ms: i64,
    /// Whole-request deadline for track queries
    pub query_timeout_ms: u64,
    /// Points buffered before a time-series write
    pub write_batch_size: usize,
    /// Minimum spacing of position points sent to the time-series store
    pub position_point_interval_ms: i64,
    pub use_delta_timestamp: bool,
    pub listen: String,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            self_id: "self".to_string(),
            influx: InfluxConfig::default(),
            black_or_white: ListMode::default(),
            black_or_whitelist: Vec::new(),
            track_db_path: PathBuf::from("track.sqlite"),
            min_write_interval_ms: MIN_WRITE_INTERVAL_MS,
            track_cutoff_interval_ms: TRACK_CUTOFF_INTERVAL_MS,
            query_timeout_ms: 30_000,
            write_batch_size: 1_000,
            position_point_interval_ms: 1_000,
            use_delta_timestamp: true,
            listen: "0.0.0.0:3000".to_string(),
        }
    }
}

impl StashConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: StashConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StashError::Config(format!("Cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.self_id.trim().is_empty() {
            return Err(StashError::Config("selfId must not be empty".to_string()));
        }
        if self.min_write_interval_ms <= 0 {
            return Err(StashError::Config(
                "minWriteIntervalMs must be positive".to_string(),
            ));
        }
        if self.track_cutoff_interval_ms < self.min_write_interval_ms {
            return Err(StashError::Config(
                "trackCutoffIntervalMs must not be shorter than minWriteIntervalMs".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(StashError::Config("queryTimeoutMs must be positive".to_string()));
        }
        if self.write_batch_size == 0 {
            return Err(StashError::Config("writeBatchSize must be positive".to_string()));
        }
        Ok(())
    }

    pub fn self_context(&self) -> String {
        format!("vessels.{}", self.self_id)
    }

    pub fn track_store_config(&self) -> TrackStoreConfig {
        TrackStoreConfig {
            min_interval_ms: self.min_write_interval_ms,
            track_cutoff_ms: self.track_cutoff_interval_ms,
        }
    }

    pub fn path_filter(&self) -> PathFilter {
        PathFilter::new(self.black_or_white, self.black_or_whitelist.iter().cloned())
    }

    pub fn query_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.query_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = StashConfig::from_json_str("{}").unwrap();
        assert_eq!(config, StashConfig::default());
        assert_eq!(config.self_context(), "vessels.self");
        assert_eq!(config.track_store_config(), TrackStoreConfig::default());
    }

    #[test]
    fn test_parse_plugin_style_options() {
        let json = r#"{
            "selfId": "urn:mrn:imo:mmsi:230099999",
            "influx": {"host": "influx.local", "database": "boat"},
            "blackOrWhite": "White",
            "blackOrWhitelist": ["propulsion.revolutions"],
            "queryTimeoutMs": 5000
        }"#;
        let config = StashConfig::from_json_str(json).unwrap();
        assert_eq!(config.self_context(), "vessels.urn:mrn:imo:mmsi:230099999");
        assert_eq!(config.influx.host, "influx.local");
        assert_eq!(config.influx.port, 8086);
        assert_eq!(config.query_timeout(), std::time::Duration::from_secs(5));

        let filter = config.path_filter();
        assert!(filter.allows("propulsion.revolutions"));
        assert!(!filter.allows("environment.wind.speedApparent"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            StashConfig::from_json_str(r#"{"trackCutoffIntervalMs": 10}"#),
            Err(StashError::Config(_))
        ));
        assert!(matches!(
            StashConfig::from_json_str("{not json"),
            Err(StashError::Json(_))
        ));
    }

    #[test]
    fn test_path_filter_modes() {
        let black = PathFilter::new(ListMode::Black, vec!["a".to_string()]);
        assert!(!black.allows("a"));
        assert!(black.allows("b"));

        let empty_white = PathFilter::new(ListMode::White, Vec::new());
        assert!(empty_white.allows("anything"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stash.json");
        std::fs::write(&path, r#"{"selfId": "boat"}"#).unwrap();
        assert_eq!(StashConfig::load(&path).unwrap().self_id, "boat");
        assert!(StashConfig::load(dir.path().join("missing.json")).is_err());
    }
}
