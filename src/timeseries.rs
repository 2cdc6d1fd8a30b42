//! # Time-Series Collaborator
//!
//! Interface to the external store holding sensor series, plus the
//! parameterized aggregate queries FeatureAssembler issues against it.
//!
//! Results of [`TimeSeriesStore::query`] must come back in submission order
//! and with exactly one row set per query: position is the only key tying a
//! result to the track and path it was issued for.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StashError};
use crate::resolution::BucketWidth;

/// Measurement holding position points, encoded as JSON `[lon, lat]`.
pub const POSITION_MEASUREMENT: &str = "navigation.position";

// ============================================================================
// Points
// ============================================================================

/// Field value of a written point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

/// A single point to write: `{measurement, timestamp?, fields: {value}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    /// None lets the store assign its own receive time
    pub timestamp: Option<DateTime<Utc>>,
    pub value: FieldValue,
}

impl Point {
    pub fn number(measurement: &str, timestamp: Option<DateTime<Utc>>, value: f64) -> Self {
        Self {
            measurement: measurement.to_string(),
            timestamp,
            value: FieldValue::Number(value),
        }
    }

    /// Position point with the `[lon, lat]` text encoding.
    pub fn position(timestamp: Option<DateTime<Utc>>, latitude: f64, longitude: f64) -> Self {
        Self {
            measurement: POSITION_MEASUREMENT.to_string(),
            timestamp,
            value: FieldValue::Text(Value::from(vec![longitude, latitude]).to_string()),
        }
    }
}

// ============================================================================
// Aggregate Queries
// ============================================================================

/// Per-bucket aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregate {
    /// Earliest value in the bucket
    First,
    /// Smallest numeric value in the bucket
    Min,
}

impl Aggregate {
    fn function(self) -> &'static str {
        match self {
            Aggregate::First => "first",
            Aggregate::Min => "min",
        }
    }
}

/// Output column an aggregate is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Column {
    Position,
    Value,
}

impl Column {
    pub fn name(self) -> &'static str {
        match self {
            Column::Position => "position",
            Column::Value => "value",
        }
    }
}

/// One time-bucketed aggregate over a measurement and closed time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub measurement: String,
    pub aggregate: Aggregate,
    pub column: Column,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub bucket: BucketWidth,
}

impl AggregateQuery {
    /// First position per bucket.
    pub fn first_position(start: DateTime<Utc>, end: DateTime<Utc>, bucket: BucketWidth) -> Self {
        Self {
            measurement: POSITION_MEASUREMENT.to_string(),
            aggregate: Aggregate::First,
            column: Column::Position,
            start,
            end,
            bucket,
        }
    }

    /// Representative (minimum) value of `path` per bucket.
    pub fn representative_value(
        path: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket: BucketWidth,
    ) -> Self {
        Self {
            measurement: path.to_string(),
            aggregate: Aggregate::Min,
            column: Column::Value,
            start,
            end,
            bucket,
        }
    }

    /// InfluxQL statement for this query with its time bounds left as
    /// `$start_<n>` / `$end_<n>` bind parameters. The measurement is quoted
    /// as an identifier; the bucket literal comes from [`BucketWidth`].
    pub fn statement(&self, n: usize) -> String {
        format!(
            "SELECT {}(\"value\") AS \"{}\" FROM {} WHERE time >= $start_{n} AND time <= $end_{n} GROUP BY time({})",
            self.aggregate.function(),
            self.column.name(),
            quote_identifier(&self.measurement),
            self.bucket.as_duration_literal(),
            n = n
        )
    }

    /// Bind parameters for [`AggregateQuery::statement`].
    pub fn bind_params(&self, n: usize, params: &mut Map<String, Value>) {
        params.insert(format!("start_{}", n), Value::from(rfc3339(self.start)));
        params.insert(format!("end_{}", n), Value::from(rfc3339(self.end)));
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Quote an InfluxQL identifier, escaping backslashes and double quotes.
pub fn quote_identifier(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

// ============================================================================
// Results
// ============================================================================

/// One bucket of an aggregate result. Empty buckets carry no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRow {
    pub time: DateTime<Utc>,
    pub value: Option<f64>,
    pub position: Option<String>,
}

impl BucketRow {
    pub fn empty(time: DateTime<Utc>) -> Self {
        Self {
            time,
            value: None,
            position: None,
        }
    }
}

pub type RowSet = Vec<BucketRow>;

// ============================================================================
// Collaborator Trait
// ============================================================================

/// External time-series storage.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn write(&self, points: &[Point]) -> Result<()>;

    /// Run all queries as one batch; one row set per query, in order.
    async fn query(&self, queries: &[AggregateQuery]) -> Result<Vec<RowSet>>;

    /// Names of all known series.
    async fn series_names(&self) -> Result<Vec<String>>;
}

// ============================================================================
// In-Memory Store
// ============================================================================

/// In-process time-series store with the same bucketing semantics as the
/// InfluxDB client: every bucket from the one containing `start` through
/// `end` is returned, empty ones with null fields.
#[derive(Debug, Default)]
pub struct MemoryTimeSeries {
    series: RwLock<HashMap<String, BTreeMap<i64, Vec<FieldValue>>>>,
}

impl MemoryTimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point_count(&self) -> usize {
        self.series
            .read()
            .map(|s| s.values().flat_map(|m| m.values()).map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn run(
        series: &HashMap<String, BTreeMap<i64, Vec<FieldValue>>>,
        query: &AggregateQuery,
    ) -> Result<RowSet> {
        let width = query.bucket.as_millis();
        let start = query.start.timestamp_millis();
        let end = query.end.timestamp_millis();
        if end < start {
            return Ok(Vec::new());
        }

        let points = series.get(&query.measurement);
        let mut rows = Vec::new();
        let mut bucket = query.bucket.bucket_start(start);
        while bucket <= end {
            let time = DateTime::from_timestamp_millis(bucket)
                .ok_or_else(|| StashError::collaborator(format!("bucket {} out of range", bucket)))?;
            let mut row = BucketRow::empty(time);

            let from = bucket.max(start);
            let to = (bucket + width - 1).min(end);
            let values = points
                .into_iter()
                .flat_map(|p| p.range(from..=to))
                .flat_map(|(_, vs)| vs.iter());

            match (query.aggregate, query.column) {
                (Aggregate::First, Column::Position) => {
                    row.position = values
                        .filter_map(|v| match v {
                            FieldValue::Text(s) => Some(s.clone()),
                            FieldValue::Number(_) => None,
                        })
                        .next();
                }
                (Aggregate::First, Column::Value) => {
                    row.value = values
                        .filter_map(|v| match v {
                            FieldValue::Number(n) => Some(*n),
                            FieldValue::Text(_) => None,
                        })
                        .next();
                }
                (Aggregate::Min, column) => {
                    let min = values
                        .filter_map(|v| match v {
                            FieldValue::Number(n) => Some(*n),
                            FieldValue::Text(_) => None,
                        })
                        .fold(None, |acc: Option<f64>, n| Some(acc.map_or(n, |a| a.min(n))));
                    match column {
                        Column::Value => row.value = min,
                        Column::Position => row.position = min.map(|n| n.to_string()),
                    }
                }
            }

            rows.push(row);
            bucket += width;
        }
        Ok(rows)
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeries {
    async fn write(&self, points: &[Point]) -> Result<()> {
        let mut series = self
            .series
            .write()
            .map_err(|_| StashError::collaborator("series lock poisoned"))?;
        let now = Utc::now();
        for point in points {
            let time = point.timestamp.unwrap_or(now).timestamp_millis();
            series
                .entry(point.measurement.clone())
                .or_default()
                .entry(time)
                .or_default()
                .push(point.value.clone());
        }
        Ok(())
    }

    async fn query(&self, queries: &[AggregateQuery]) -> Result<Vec<RowSet>> {
        let series = self
            .series
            .read()
            .map_err(|_| StashError::collaborator("series lock poisoned"))?;
        queries.iter().map(|q| Self::run(&series, q)).collect()
    }

    async fn series_names(&self) -> Result<Vec<String>> {
        let series = self
            .series
            .read()
            .map_err(|_| StashError::collaborator("series lock poisoned"))?;
        let mut names: Vec<String> = series.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
