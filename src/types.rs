//! Input types shared by ingestion and queries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StashError;

/// A single vessel position as received from the delta feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
}

impl PositionSample {
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
        }
    }

    /// Sample timestamp as epoch milliseconds.
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Check if the sample has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Axis-aligned map region given by its southwest and northeast corners.
///
/// The textual form is `swLng,swLat,neLng,neLat`, the order map clients send
/// in the `bbox` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub sw_lng: f64,
    pub sw_lat: f64,
    pub ne_lng: f64,
    pub ne_lat: f64,
}

impl BoundingBox {
    pub fn new(sw_lng: f64, sw_lat: f64, ne_lng: f64, ne_lat: f64) -> Self {
        Self {
            sw_lng,
            sw_lat,
            ne_lng,
            ne_lat,
        }
    }

    /// Whether the box spans the antimeridian (west edge east of the east edge).
    pub fn crosses_antimeridian(&self) -> bool {
        self.sw_lng > self.ne_lng
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        let lat_ok = latitude >= self.sw_lat && latitude <= self.ne_lat;
        let lng_ok = if self.crosses_antimeridian() {
            longitude >= self.sw_lng || longitude <= self.ne_lng
        } else {
            longitude >= self.sw_lng && longitude <= self.ne_lng
        };
        lat_ok && lng_ok
    }
}

impl FromStr for BoundingBox {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(StashError::BadRequest(format!(
                "bbox must be swLng,swLat,neLng,neLat, got {:?}",
                s
            )));
        }

        let mut values = [0.0f64; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    StashError::BadRequest(format!("bbox component {:?} is not a number", part))
                })?;
        }

        let [sw_lng, sw_lat, ne_lng, ne_lat] = values;
        if !(-90.0..=90.0).contains(&sw_lat) || !(-90.0..=90.0).contains(&ne_lat) {
            return Err(StashError::BadRequest(format!(
                "bbox latitude out of range in {:?}",
                s
            )));
        }
        if !(-180.0..=180.0).contains(&sw_lng) || !(-180.0..=180.0).contains(&ne_lng) {
            return Err(StashError::BadRequest(format!(
                "bbox longitude out of range in {:?}",
                s
            )));
        }
        if sw_lat > ne_lat {
            return Err(StashError::BadRequest(format!(
                "bbox south edge is north of its north edge in {:?}",
                s
            )));
        }

        Ok(Self::new(sw_lng, sw_lat, ne_lng, ne_lat))
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.sw_lng, self.sw_lat, self.ne_lng, self.ne_lat
        )
    }
}
