//! # Geohash Index Codec
//!
//! Converts coordinates to base-32 geohash strings and map regions to the set
//! of hash prefixes covering them.
//!
//! Every stored position is hashed at [`STORAGE_PRECISION`], so any coarser
//! query prefix can be matched against stored rows with a plain prefix test.
//! Queries pick the finest precision whose covering set still fits in
//! [`PREFIX_BUDGET`] cells.

use std::collections::BTreeSet;

use log::debug;

use crate::types::BoundingBox;

/// Geohash base-32 alphabet (no `a`, `i`, `l`, `o`).
const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Precision of hashes written to the track store.
pub const STORAGE_PRECISION: usize = 9;

/// Finest precision considered when covering a query region.
pub const MAX_QUERY_PRECISION: usize = 9;

/// Maximum number of prefixes a query may fan out to.
pub const PREFIX_BUDGET: usize = 32;

/// Bounds of a single geohash cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashCell {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl HashCell {
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

/// Number of (latitude, longitude) bits in a hash of the given precision.
/// Longitude takes the first bit, so it gets the extra one on odd totals.
fn bit_split(precision: usize) -> (u32, u32) {
    let total = (precision * 5) as u32;
    (total / 2, total - total / 2)
}

fn cell_index(value: f64, min: f64, max: f64, bits: u32) -> u64 {
    let cells = (1u64 << bits) as f64;
    let idx = ((value - min) / (max - min) * cells).floor();
    idx.clamp(0.0, cells - 1.0) as u64
}

fn hash_from_indices(lat_idx: u64, lon_idx: u64, precision: usize) -> String {
    let (lat_bits, lon_bits) = bit_split(precision);
    let mut lat_pos = lat_bits;
    let mut lon_pos = lon_bits;
    let mut hash = String::with_capacity(precision);
    let mut ch = 0u8;

    for i in 0..precision * 5 {
        let bit = if i % 2 == 0 {
            lon_pos -= 1;
            (lon_idx >> lon_pos) & 1
        } else {
            lat_pos -= 1;
            (lat_idx >> lat_pos) & 1
        };
        ch = (ch << 1) | bit as u8;
        if i % 5 == 4 {
            hash.push(BASE32[ch as usize] as char);
            ch = 0;
        }
    }
    hash
}

/// Encode a coordinate at the storage precision.
pub fn encode(latitude: f64, longitude: f64) -> String {
    encode_with_precision(latitude, longitude, STORAGE_PRECISION)
}

/// Encode a coordinate at an explicit precision (number of characters).
pub fn encode_with_precision(latitude: f64, longitude: f64, precision: usize) -> String {
    let (lat_bits, lon_bits) = bit_split(precision);
    hash_from_indices(
        cell_index(latitude, -90.0, 90.0, lat_bits),
        cell_index(longitude, -180.0, 180.0, lon_bits),
        precision,
    )
}

/// Decode a hash into the bounds of its cell. Returns None for characters
/// outside the geohash alphabet.
pub fn decode_bbox(hash: &str) -> Option<HashCell> {
    let mut lat_idx = 0u64;
    let mut lon_idx = 0u64;
    let mut bit_no = 0usize;

    for c in hash.bytes() {
        let value = BASE32.iter().position(|&b| b == c)? as u64;
        for shift in (0..5).rev() {
            let bit = (value >> shift) & 1;
            if bit_no % 2 == 0 {
                lon_idx = (lon_idx << 1) | bit;
            } else {
                lat_idx = (lat_idx << 1) | bit;
            }
            bit_no += 1;
        }
    }

    let (lat_bits, lon_bits) = bit_split(hash.len());
    let lat_size = 180.0 / (1u64 << lat_bits) as f64;
    let lon_size = 360.0 / (1u64 << lon_bits) as f64;

    Some(HashCell {
        min_lat: -90.0 + lat_idx as f64 * lat_size,
        max_lat: -90.0 + (lat_idx + 1) as f64 * lat_size,
        min_lng: -180.0 + lon_idx as f64 * lon_size,
        max_lng: -180.0 + (lon_idx + 1) as f64 * lon_size,
    })
}

/// Cell index ranges covering a region: latitude range plus one or two
/// longitude ranges (two when the region spans the antimeridian).
struct CoverRanges {
    lat: (u64, u64),
    lon: Vec<(u64, u64)>,
}

fn cover_ranges(bbox: &BoundingBox, precision: usize) -> CoverRanges {
    let (lat_bits, lon_bits) = bit_split(precision);
    let lat = (
        cell_index(bbox.sw_lat, -90.0, 90.0, lat_bits),
        cell_index(bbox.ne_lat, -90.0, 90.0, lat_bits),
    );
    let west = cell_index(bbox.sw_lng, -180.0, 180.0, lon_bits);
    let east = cell_index(bbox.ne_lng, -180.0, 180.0, lon_bits);
    let lon = if bbox.crosses_antimeridian() {
        vec![(west, (1u64 << lon_bits) - 1), (0, east)]
    } else {
        vec![(west, east)]
    };
    CoverRanges { lat, lon }
}

/// Number of cells needed to cover the region at a precision, without
/// materializing them.
pub fn covering_count(bbox: &BoundingBox, precision: usize) -> u64 {
    let ranges = cover_ranges(bbox, precision);
    let rows = ranges.lat.1 - ranges.lat.0 + 1;
    let cols: u64 = ranges.lon.iter().map(|(lo, hi)| hi - lo + 1).sum();
    rows * cols
}

/// All cells of the given precision intersecting the region, sorted.
pub fn covering_cells(bbox: &BoundingBox, precision: usize) -> Vec<String> {
    let ranges = cover_ranges(bbox, precision);
    let mut cells = BTreeSet::new();
    for lat_idx in ranges.lat.0..=ranges.lat.1 {
        for &(lo, hi) in &ranges.lon {
            for lon_idx in lo..=hi {
                cells.insert(hash_from_indices(lat_idx, lon_idx, precision));
            }
        }
    }
    cells.into_iter().collect()
}

/// Prefixes covering the region at the finest precision that stays within
/// the fan-out budget.
///
/// Precision grows from 1; the set from the last level that fit is kept as
/// soon as a level needs more than [`PREFIX_BUDGET`] cells. Precision 1 has
/// only 32 cells in total, so the result is never empty.
pub fn covering_prefixes(bbox: &BoundingBox) -> Vec<String> {
    let mut accepted = Vec::new();
    let mut accepted_precision = 0;

    for precision in 1..=MAX_QUERY_PRECISION {
        if covering_count(bbox, precision) > PREFIX_BUDGET as u64 {
            break;
        }
        accepted = covering_cells(bbox, precision);
        accepted_precision = precision;
    }

    debug!(
        "[Geohash] bbox {} -> {} prefixes at precision {}",
        bbox,
        accepted.len(),
        accepted_precision
    );
    accepted
}
