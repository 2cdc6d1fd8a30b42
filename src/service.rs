//! Transport-independent logic behind the track and series endpoints.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{OptionExt, Result, StashError};
use crate::features::{FeatureAssembler, FeatureCollection};
use crate::persistence::TrackStore;
use crate::resolution::select_resolution;
use crate::timeseries::TimeSeriesStore;
use crate::types::BoundingBox;

pub const MISSING_BBOX: &str = "No bbox (hint: ?bbox=25.3,60.08,25.4,60.28)";

/// Query parameters of the tracks endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackQuery {
    pub bbox: Option<String>,
    /// Comma-separated extra series paths
    pub paths: Option<String>,
}

impl TrackQuery {
    pub fn new(bbox: &str) -> Self {
        Self {
            bbox: Some(bbox.to_string()),
            paths: None,
        }
    }

    pub fn with_paths(mut self, paths: &str) -> Self {
        self.paths = Some(paths.to_string());
        self
    }

    /// Requested paths in order, blanks removed.
    pub fn data_paths(&self) -> Vec<String> {
        self.paths
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub source: String,
    pub name: String,
}

pub struct TrackService {
    tracks: Arc<TrackStore>,
    series: Arc<dyn TimeSeriesStore>,
    assembler: FeatureAssembler,
    source: String,
    timeout: Duration,
}

impl TrackService {
    /// `source` labels the entries of the series listing.
    pub fn new(
        tracks: Arc<TrackStore>,
        series: Arc<dyn TimeSeriesStore>,
        source: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            tracks,
            assembler: FeatureAssembler::new(series.clone()),
            series,
            source: source.into(),
            timeout,
        }
    }

    pub fn track_store(&self) -> &Arc<TrackStore> {
        &self.tracks
    }

    /// Tracks crossing the requested bbox as a GeoJSON feature collection.
    pub async fn tracks(&self, query: &TrackQuery) -> Result<FeatureCollection> {
        let bbox: BoundingBox = query.bbox.as_deref().ok_or_bad_request(MISSING_BBOX)?.parse()?;
        let data_paths = query.data_paths();

        tokio::time::timeout(self.timeout, self.run(bbox, &data_paths))
            .await
            .map_err(|_| StashError::Timeout(self.timeout))?
    }

    async fn run(&self, bbox: BoundingBox, data_paths: &[String]) -> Result<FeatureCollection> {
        let tracks = self.tracks.clone();
        let periods = tokio::task::spawn_blocking(move || tracks.get_periods(&bbox))
            .await
            .map_err(|e| StashError::StoreUnavailable(format!("period lookup aborted: {}", e)))??;

        let resolution = select_resolution(&bbox);
        debug!(
            "[TrackService] bbox={} periods={} resolution={}",
            bbox,
            periods.len(),
            resolution
        );
        self.assembler.assemble(&periods, resolution, data_paths).await
    }

    /// Every series name known to the time-series store.
    pub async fn series(&self) -> Result<Vec<SeriesInfo>> {
        let names = tokio::time::timeout(self.timeout, self.series.series_names())
            .await
            .map_err(|_| StashError::Timeout(self.timeout))??;
        Ok(names
            .into_iter()
            .map(|name| SeriesInfo {
                source: self.source.clone(),
                name,
            })
            .collect())
    }
}
