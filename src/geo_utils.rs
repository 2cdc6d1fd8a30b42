//! Geographic utilities (great-circle distances).

use geo::{Distance, Haversine, Point};

use crate::types::BoundingBox;

/// Calculate haversine distance between two coordinates in meters.
pub fn haversine_distance(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let point1 = Point::new(lng1, lat1);
    let point2 = Point::new(lng2, lat2);
    Haversine::distance(point1, point2)
}

/// Great-circle distance between the southwest and northeast corners.
pub fn diagonal_distance(bbox: &BoundingBox) -> f64 {
    haversine_distance(bbox.sw_lat, bbox.sw_lng, bbox.ne_lat, bbox.ne_lng)
}
