//! # Resolution Selection
//!
//! Maps the size of a query region to the time-bucket width used when
//! aggregating series: a harbour-sized view gets per-second detail, an ocean
//! crossing one bucket per day.

use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::geo_utils::diagonal_distance;
use crate::types::BoundingBox;

/// Discrete aggregation bucket widths, ordered from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BucketWidth {
    OneSecond,
    TenSeconds,
    OneMinute,
    OneHour,
    OneDay,
}

impl BucketWidth {
    /// Bucket width in milliseconds.
    pub fn as_millis(self) -> i64 {
        match self {
            BucketWidth::OneSecond => 1_000,
            BucketWidth::TenSeconds => 10_000,
            BucketWidth::OneMinute => 60_000,
            BucketWidth::OneHour => 3_600_000,
            BucketWidth::OneDay => 86_400_000,
        }
    }

    /// InfluxQL duration literal for `GROUP BY time(..)`.
    pub fn as_duration_literal(self) -> &'static str {
        match self {
            BucketWidth::OneSecond => "1s",
            BucketWidth::TenSeconds => "10s",
            BucketWidth::OneMinute => "1m",
            BucketWidth::OneHour => "1h",
            BucketWidth::OneDay => "1d",
        }
    }

    /// Start of the bucket containing `millis`.
    pub fn bucket_start(self, millis: i64) -> i64 {
        millis.div_euclid(self.as_millis()) * self.as_millis()
    }
}

impl fmt::Display for BucketWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_duration_literal())
    }
}

/// Ascending (exclusive upper distance in meters, bucket width) table.
const DISTANCE_TO_BUCKET: [(f64, BucketWidth); 5] = [
    (2_000.0, BucketWidth::OneSecond),
    (20_000.0, BucketWidth::TenSeconds),
    (200_000.0, BucketWidth::OneMinute),
    (1_000_000.0, BucketWidth::OneHour),
    (10_000_000_000.0, BucketWidth::OneDay),
];

/// Bucket width for a diagonal distance; distances past the table fall back
/// to the coarsest bucket.
pub fn resolution_for_distance(meters: f64) -> BucketWidth {
    DISTANCE_TO_BUCKET
        .iter()
        .find(|(threshold, _)| meters < *threshold)
        .map(|(_, width)| *width)
        .unwrap_or(BucketWidth::OneDay)
}

/// Bucket width for a query region, from its corner-to-corner distance.
pub fn select_resolution(bbox: &BoundingBox) -> BucketWidth {
    let distance = diagonal_distance(bbox);
    let width = resolution_for_distance(distance);
    debug!(
        "[Resolution] bbox {} diagonal {:.0}m -> {}",
        bbox, distance, width
    );
    width
}
