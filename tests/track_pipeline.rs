//! End-to-end: delta feed in, GeoJSON tracks out, over an on-disk track db
//! and the in-memory time-series store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use track_stash::{
    Delta, DeltaIngester, MemoryTimeSeries, PositionSample, StashConfig, TimeSeriesStore,
    TrackQuery, TrackService, TrackStore,
};

const BBOX: &str = "24.9,60.0,25.1,60.2";

struct Harness {
    _dir: TempDir,
    tracks: Arc<TrackStore>,
    series: Arc<MemoryTimeSeries>,
    ingester: DeltaIngester,
    service: TrackService,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = StashConfig {
        track_db_path: dir.path().join("track.sqlite"),
        write_batch_size: 1,
        ..StashConfig::default()
    };
    let tracks = Arc::new(TrackStore::open(&config.track_db_path, config.track_store_config()).unwrap());
    let series = Arc::new(MemoryTimeSeries::new());
    let store: Arc<dyn TimeSeriesStore> = series.clone();
    Harness {
        ingester: DeltaIngester::new(&config, tracks.clone(), store.clone()),
        service: TrackService::new(tracks.clone(), store, "signalk", Duration::from_secs(5)),
        tracks,
        series,
        _dir: dir,
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2018, 6, 1, 12, 0, 0).unwrap()
}

fn delta_at(time: DateTime<Utc>, values: Value) -> Delta {
    serde_json::from_value(json!({
        "context": "vessels.self",
        "updates": [{"timestamp": time.to_rfc3339(), "values": values}]
    }))
    .unwrap()
}

fn position(lat: f64, lon: f64) -> Value {
    json!({"path": "navigation.position", "value": {"latitude": lat, "longitude": lon}})
}

fn revolutions(value: f64) -> Value {
    json!({"path": "propulsion.revolutions", "value": value})
}

fn coordinates(fc: &Value, feature: usize) -> &Vec<Value> {
    fc["features"][feature]["geometry"]["coordinates"][0]
        .as_array()
        .unwrap()
}

#[tokio::test]
async fn single_position_round_trips_to_geojson() {
    let h = harness();
    h.ingester
        .write(&delta_at(t0(), json!([position(60.1, 25.0)])))
        .await
        .unwrap();

    let fc = h.service.tracks(&TrackQuery::new(BBOX)).await.unwrap();
    let fc = serde_json::to_value(&fc).unwrap();

    assert_eq!(fc["type"], "FeatureCollection");
    assert_eq!(fc["features"].as_array().unwrap().len(), 1);
    assert_eq!(fc["features"][0]["properties"]["name"], "Track");
    assert_eq!(
        coordinates(&fc, 0)[0],
        json!([25.0, 60.1, 0.0, t0().timestamp_millis()])
    );
}

#[tokio::test]
async fn samples_past_cutoff_become_two_tracks() {
    let h = harness();
    let later = t0() + chrono::Duration::minutes(25);
    h.ingester
        .write(&delta_at(t0(), json!([position(60.1, 25.0)])))
        .await
        .unwrap();
    h.ingester
        .write(&delta_at(later, json!([position(60.11, 25.01)])))
        .await
        .unwrap();

    assert_eq!(h.tracks.track_count().unwrap(), 2);

    let fc = h.service.tracks(&TrackQuery::new(BBOX)).await.unwrap();
    assert_eq!(fc.features.len(), 2);
    assert_ne!(fc.features[0].properties.id, fc.features[1].properties.id);
    assert!(fc.features[0].properties.start_time < fc.features[1].properties.start_time);
}

#[tokio::test]
async fn extra_path_values_align_with_coordinates() {
    let h = harness();
    h.ingester
        .write(&delta_at(t0(), json!([position(60.1, 25.0)])))
        .await
        .unwrap();
    let second = t0() + chrono::Duration::seconds(90);
    h.ingester
        .write(&delta_at(second, json!([position(60.11, 25.01), revolutions(14.5)])))
        .await
        .unwrap();

    let query = TrackQuery::new(BBOX).with_paths("propulsion.revolutions");
    let fc = serde_json::to_value(h.service.tracks(&query).await.unwrap()).unwrap();

    assert_eq!(fc["properties"]["dataPaths"], json!(["propulsion.revolutions"]));
    let coords = coordinates(&fc, 0);
    assert_eq!(coords.len(), 2);
    assert_eq!(coords[0].as_array().unwrap().len(), 4);
    assert_eq!(coords[1].as_array().unwrap().len(), 5);
    assert_eq!(coords[1][4], json!(14.5));
}

#[tokio::test]
async fn empty_region_gives_empty_collection() {
    let h = harness();
    h.ingester
        .write(&delta_at(t0(), json!([position(60.1, 25.0)])))
        .await
        .unwrap();

    let fc = h
        .service
        .tracks(&TrackQuery::new("-70.0,-40.0,-69.9,-39.9"))
        .await
        .unwrap();
    let fc = serde_json::to_value(&fc).unwrap();
    assert_eq!(fc["type"], "FeatureCollection");
    assert_eq!(fc["features"], json!([]));
}

#[tokio::test]
async fn throttled_samples_are_not_stored() {
    let h = harness();
    for seconds in [0, 20, 40, 61] {
        let sample = PositionSample::new(t0() + chrono::Duration::seconds(seconds), 60.1, 25.0);
        h.tracks.ingest(&[sample]).unwrap();
    }
    assert_eq!(h.tracks.position_count().unwrap(), 2);
    assert_eq!(h.tracks.track_count().unwrap(), 1);
    assert!(h.series.point_count() == 0);
}

#[test]
fn reopened_store_keeps_tracks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("track.sqlite");
    {
        let store = TrackStore::open(&path, Default::default()).unwrap();
        store.ingest(&[PositionSample::new(t0(), 60.1, 25.0)]).unwrap();
    }
    let store = TrackStore::open(&path, Default::default()).unwrap();
    assert_eq!(store.position_count().unwrap(), 1);
    let bbox = BBOX.parse().unwrap();
    assert_eq!(store.get_periods(&bbox).unwrap().len(), 1);
}
