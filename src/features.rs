//! # Feature Assembly
//!
//! Turns track periods into GeoJSON features:
//!
//! 1. Build one first-position query per period, plus one representative
//!    value query per extra path, all at the selected bucket width
//! 2. Run every query as one batch against the time-series store
//! 3. Consume results in groups of `1 + paths.len()` per period: the first
//!    result becomes the line geometry, the others are appended to the
//!    coordinates whose bucket timestamp they share
//!
//! Coordinates are `[lon, lat, 0, epochMillis, ...values]`. Values are
//! appended in path order but buckets without a value for a path are
//! skipped, so a value's index does not identify its `dataPaths` entry once
//! two or more paths are requested.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use serde::ser::{SerializeSeq, Serializer};
use serde::Serialize;

use crate::error::{Result, StashError};
use crate::periods::TrackPeriod;
use crate::resolution::BucketWidth;
use crate::timeseries::{AggregateQuery, BucketRow, TimeSeriesStore};

// ============================================================================
// GeoJSON Types
// ============================================================================

/// One geometry vertex with its bucket time and any appended series values.
#[derive(Debug, Clone, PartialEq)]
pub struct Coordinate {
    pub longitude: f64,
    pub latitude: f64,
    pub elevation: f64,
    /// Bucket start, epoch milliseconds
    pub time: i64,
    pub values: Vec<f64>,
}

impl Coordinate {
    /// Number of elements in the serialized tuple.
    pub fn tuple_len(&self) -> usize {
        4 + self.values.len()
    }
}

impl Serialize for Coordinate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.tuple_len()))?;
        seq.serialize_element(&self.longitude)?;
        seq.serialize_element(&self.latitude)?;
        seq.serialize_element(&self.elevation)?;
        seq.serialize_element(&self.time)?;
        for value in &self.values {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MultiLineString {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub coordinates: Vec<Vec<Coordinate>>,
}

impl MultiLineString {
    fn single_line(line: Vec<Coordinate>) -> Self {
        Self {
            kind: "MultiLineString",
            coordinates: vec![line],
        }
    }

    /// The single line every track feature carries.
    pub fn line(&self) -> &[Coordinate] {
        self.coordinates.first().map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureProperties {
    pub id: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clipped_start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clipped_end_time: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub properties: FeatureProperties,
    pub geometry: MultiLineString,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionProperties {
    pub data_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub properties: CollectionProperties,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    /// The single empty shape returned whenever there is nothing to draw.
    pub fn empty(data_paths: &[String]) -> Self {
        Self::new(data_paths, Vec::new())
    }

    fn new(data_paths: &[String], features: Vec<Feature>) -> Self {
        Self {
            kind: "FeatureCollection",
            properties: CollectionProperties {
                data_paths: data_paths.to_vec(),
            },
            features,
        }
    }
}

fn iso(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Query Construction
// ============================================================================

/// Queries for all periods, grouped per period: position first, then one per
/// path in the given order.
pub fn build_queries(
    periods: &[TrackPeriod],
    resolution: BucketWidth,
    data_paths: &[String],
) -> Vec<AggregateQuery> {
    let mut queries = Vec::with_capacity(periods.len() * (1 + data_paths.len()));
    for period in periods {
        queries.push(AggregateQuery::first_position(period.start, period.end, resolution));
        for path in data_paths {
            queries.push(AggregateQuery::representative_value(
                path,
                period.start,
                period.end,
                resolution,
            ));
        }
    }
    queries
}

// ============================================================================
// Reassembly
// ============================================================================

/// Parse the stored `[lon, lat]` position encoding.
pub fn parse_position(raw: &str) -> Result<(f64, f64)> {
    let corrupt = |message: String| StashError::DataCorruption {
        raw: raw.to_string(),
        message,
    };
    let values: Vec<f64> = serde_json::from_str(raw).map_err(|e| corrupt(e.to_string()))?;
    match values.as_slice() {
        [lon, lat, ..] if lon.is_finite() && lat.is_finite() => Ok((*lon, *lat)),
        _ => Err(corrupt("expected [lon, lat]".to_string())),
    }
}

/// Line geometry from a first-position result. Buckets without a position
/// are skipped, and so are corrupt encodings (logged).
fn to_line(rows: &[BucketRow]) -> Vec<Coordinate> {
    rows.iter()
        .filter_map(|row| {
            let raw = row.position.as_deref()?;
            match parse_position(raw) {
                Ok((longitude, latitude)) => Some(Coordinate {
                    longitude,
                    latitude,
                    elevation: 0.0,
                    time: row.time.timestamp_millis(),
                    values: Vec::new(),
                }),
                Err(e) => {
                    warn!("[FeatureAssembler] Skipping bucket {}: {}", iso(row.time), e);
                    None
                }
            }
        })
        .collect()
}

/// Append each row's value to the coordinate with the same bucket time.
/// Rows without a value or without a matching coordinate are skipped.
fn push_values_by_time(line: &mut [Coordinate], rows: &[BucketRow]) {
    for row in rows {
        let Some(value) = row.value else { continue };
        let time = row.time.timestamp_millis();
        if let Ok(i) = line.binary_search_by_key(&time, |c| c.time) {
            line[i].values.push(value);
        }
    }
}

fn to_feature(period: &TrackPeriod, line: Vec<Coordinate>) -> Feature {
    let clipped = |c: Option<&Coordinate>| {
        c.and_then(|c| DateTime::from_timestamp_millis(c.time)).map(iso)
    };
    Feature {
        kind: "Feature",
        properties: FeatureProperties {
            id: period.id.clone(),
            start_time: iso(period.start),
            end_time: iso(period.end),
            clipped_start_time: clipped(line.first()),
            clipped_end_time: clipped(line.last()),
            name: "Track".to_string(),
        },
        geometry: MultiLineString::single_line(line),
    }
}

/// Rebuild features from batched results. `results` must hold exactly
/// `periods.len() * (1 + data_paths.len())` row sets in submission order.
pub fn reassemble(
    periods: &[TrackPeriod],
    results: &[Vec<BucketRow>],
    data_paths: &[String],
) -> Result<FeatureCollection> {
    let group = 1 + data_paths.len();
    if results.len() != periods.len() * group {
        return Err(StashError::collaborator(format!(
            "expected {} result sets for {} periods, got {}",
            periods.len() * group,
            periods.len(),
            results.len()
        )));
    }

    let features = periods
        .iter()
        .zip(results.chunks(group))
        .map(|(period, chunk)| {
            let mut line = to_line(&chunk[0]);
            for rows in &chunk[1..] {
                push_values_by_time(&mut line, rows);
            }
            to_feature(period, line)
        })
        .collect();

    Ok(FeatureCollection::new(data_paths, features))
}

// ============================================================================
// Assembler
// ============================================================================

pub struct FeatureAssembler {
    store: Arc<dyn TimeSeriesStore>,
}

impl FeatureAssembler {
    pub fn new(store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { store }
    }

    /// Features for `periods` with `data_paths` aligned onto the geometry.
    /// The store is not called when there is nothing to query.
    pub async fn assemble(
        &self,
        periods: &[TrackPeriod],
        resolution: BucketWidth,
        data_paths: &[String],
    ) -> Result<FeatureCollection> {
        let queries = build_queries(periods, resolution, data_paths);
        if queries.is_empty() {
            return Ok(FeatureCollection::empty(data_paths));
        }

        debug!(
            "[FeatureAssembler] {} periods, {} queries at {}",
            periods.len(),
            queries.len(),
            resolution
        );
        let results = self.store.query(&queries).await?;
        reassemble(periods, &results, data_paths)
    }
}
