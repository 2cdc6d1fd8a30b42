//! # Track Stash
//!
//! Vessel track storage and GeoJSON track queries for a Signal K delta feed.
//!
//! This library provides:
//! - Track segmentation of a position stream with a write throttle
//! - Geohash indexing of stored positions and bbox queries via prefix cover
//! - Time-bucketed GeoJSON tracks with sensor series aligned per coordinate
//!
//! ## Features
//!
//! - **`http`** - InfluxDB HTTP client implementing the time-series store
//! - **`server`** - axum router and the `track-stash` binary
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use track_stash::{geohash, select_resolution, BoundingBox, BucketWidth};
//!
//! assert_eq!(geohash::encode(57.64911, 10.40744), "u4pruydqq");
//!
//! let bbox: BoundingBox = "25.3,60.08,25.4,60.28".parse().unwrap();
//! assert_eq!(select_resolution(&bbox), BucketWidth::OneMinute);
//! assert!(geohash::covering_prefixes(&bbox).len() <= geohash::PREFIX_BUDGET);
//! ```

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, StashError};

// Position samples and bounding boxes
pub mod types;
pub use types::{BoundingBox, PositionSample};

// Geohash codec and covering prefixes
pub mod geohash;

// Geographic utilities (haversine distance)
pub mod geo_utils;

// Bbox size to time bucket width
pub mod resolution;
pub use resolution::{select_resolution, BucketWidth};

// SQLite track store with segmentation
pub mod persistence;
pub use persistence::{IngestOutcome, Track, TrackStore, TrackStoreConfig, TrackStoreStats};

// Track rows to time periods
pub mod periods;
pub use periods::{resolve_periods, TrackPeriod};

// Time-series collaborator
pub mod timeseries;
pub use timeseries::{AggregateQuery, MemoryTimeSeries, Point, TimeSeriesStore};

// InfluxDB client
#[cfg(feature = "http")]
pub mod influx;
#[cfg(feature = "http")]
pub use influx::InfluxClient;

// GeoJSON feature assembly
pub mod features;
pub use features::{Feature, FeatureAssembler, FeatureCollection};

// Delta feed ingestion
pub mod delta;
pub use delta::{Delta, DeltaIngester, IngestReport};

pub mod config;
pub use config::{InfluxConfig, ListMode, PathFilter, StashConfig};

// Endpoint logic
pub mod service;
pub use service::{SeriesInfo, TrackQuery, TrackService};

#[cfg(feature = "server")]
pub mod server;
#[cfg(feature = "server")]
pub use server::build_router;
