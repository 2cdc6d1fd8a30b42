//! # Delta Ingestion
//!
//! Consumes the vessel's delta feed. Positions go to the [`TrackStore`] one
//! sample per call; position points and numeric values are buffered and
//! written to the time-series store in batches.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Notify;

use crate::config::{PathFilter, StashConfig};
use crate::error::{Result, StashError};
use crate::persistence::{IngestOutcome, TrackStore};
use crate::timeseries::{Point, TimeSeriesStore, POSITION_MEASUREMENT};
use crate::types::PositionSample;

/// Context the feed uses for "this vessel" regardless of its identity.
const SELF_ALIAS: &str = "vessels.self";

// ============================================================================
// Delta Model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub updates: Vec<Update>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "$source", default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub values: Vec<PathValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathValue {
    pub path: String,
    pub value: Value,
}

impl Delta {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Outcome of one [`DeltaIngester::write`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub positions_stored: usize,
    pub positions_throttled: usize,
    /// Positions the track store rejected with an error
    pub positions_failed: usize,
    pub points_buffered: usize,
}

// ============================================================================
// Ingester
// ============================================================================

#[derive(Debug, Default)]
struct Buffer {
    points: Vec<Point>,
    last_position_point: i64,
}

pub struct DeltaIngester {
    tracks: Arc<TrackStore>,
    series: Arc<dyn TimeSeriesStore>,
    self_context: String,
    filter: PathFilter,
    batch_size: usize,
    position_point_interval_ms: i64,
    use_delta_timestamp: bool,
    buffer: Mutex<Buffer>,
}

impl DeltaIngester {
    pub fn new(config: &StashConfig, tracks: Arc<TrackStore>, series: Arc<dyn TimeSeriesStore>) -> Self {
        Self {
            tracks,
            series,
            self_context: config.self_context(),
            filter: config.path_filter(),
            batch_size: config.write_batch_size.max(1),
            position_point_interval_ms: config.position_point_interval_ms,
            use_delta_timestamp: config.use_delta_timestamp,
            buffer: Mutex::new(Buffer::default()),
        }
    }

    fn is_self(&self, delta: &Delta) -> bool {
        match delta.context.as_deref() {
            None => true,
            Some(context) => context == self.self_context || context == SELF_ALIAS,
        }
    }

    fn buffer(&self) -> Result<std::sync::MutexGuard<'_, Buffer>> {
        self.buffer
            .lock()
            .map_err(|_| StashError::collaborator("point buffer lock poisoned"))
    }

    /// Process one delta. Deltas for other vessels are ignored.
    ///
    /// Series points are buffered before positions reach the track store, and
    /// a track store failure is logged without costing the delta its points.
    pub async fn write(&self, delta: &Delta) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        if !self.is_self(delta) {
            return Ok(report);
        }

        let mut points = Vec::new();
        let mut samples = Vec::new();
        for update in &delta.updates {
            let timestamp = match update.timestamp {
                Some(ts) if self.use_delta_timestamp => ts,
                _ => Utc::now(),
            };
            let point_time = self.use_delta_timestamp.then_some(timestamp);

            for pv in &update.values {
                if pv.path == POSITION_MEASUREMENT {
                    if let Some(sample) = self.position(&pv.value, timestamp, &mut points)? {
                        samples.push(sample);
                    }
                } else if let Some(n) = pv.value.as_f64().filter(|n| n.is_finite()) {
                    if self.filter.allows(&pv.path) {
                        points.push(Point::number(&pv.path, point_time, n));
                    }
                }
            }
        }

        report.points_buffered = points.len();
        let batch = {
            let mut buffer = self.buffer()?;
            buffer.points.append(&mut points);
            if buffer.points.len() >= self.batch_size {
                std::mem::take(&mut buffer.points)
            } else {
                Vec::new()
            }
        };

        self.store_positions(samples, &mut report).await;
        self.write_batch(batch).await;
        Ok(report)
    }

    /// Validate a position value and queue its time-series point.
    fn position(
        &self,
        value: &Value,
        timestamp: DateTime<Utc>,
        points: &mut Vec<Point>,
    ) -> Result<Option<PositionSample>> {
        let coordinate = |key: &str| value.get(key).and_then(Value::as_f64);
        let (Some(latitude), Some(longitude)) = (coordinate("latitude"), coordinate("longitude")) else {
            warn!("[DeltaIngester] Ignoring position without latitude/longitude: {}", value);
            return Ok(None);
        };
        let sample = PositionSample::new(timestamp, latitude, longitude);
        if !sample.is_valid() {
            warn!("[DeltaIngester] Ignoring out-of-range position {},{}", latitude, longitude);
            return Ok(None);
        }

        let millis = sample.timestamp_millis();
        let mut buffer = self.buffer()?;
        if millis - buffer.last_position_point > self.position_point_interval_ms {
            points.push(Point::position(Some(timestamp), latitude, longitude));
            buffer.last_position_point = millis;
        }
        Ok(Some(sample))
    }

    /// Hand samples to the track store one per call on the blocking pool.
    async fn store_positions(&self, samples: Vec<PositionSample>, report: &mut IngestReport) {
        if samples.is_empty() {
            return;
        }
        let count = samples.len();
        let tracks = self.tracks.clone();
        let outcomes = tokio::task::spawn_blocking(move || {
            samples
                .iter()
                .map(|sample| tracks.ingest(std::slice::from_ref(sample)))
                .collect::<Vec<_>>()
        })
        .await;

        let outcomes = match outcomes {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!("[DeltaIngester] Track ingestion aborted for {} positions: {}", count, e);
                report.positions_failed += count;
                return;
            }
        };
        for outcome in outcomes {
            match outcome {
                Ok(IngestOutcome::Stored { .. }) => report.positions_stored += 1,
                Ok(IngestOutcome::Throttled) => report.positions_throttled += 1,
                Ok(IngestOutcome::Skipped) => {}
                Err(e) => {
                    warn!("[DeltaIngester] Position not stored: {}", e);
                    report.positions_failed += 1;
                }
            }
        }
    }

    /// Ingest newline-delimited deltas from `input` until EOF or `shutdown`,
    /// then flush. Shutdown is only observed between deltas, so a batch
    /// write in progress always completes. Returns the number of deltas read.
    pub async fn consume<R>(&self, input: R, shutdown: &Notify) -> usize
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut count = 0;
        loop {
            let next = tokio::select! {
                _ = shutdown.notified() => break,
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    count += 1;
                    let result = match Delta::from_json_str(&line) {
                        Ok(delta) => self.write(&delta).await.map(|_| ()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        warn!("[DeltaIngester] Skipping delta: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[DeltaIngester] Stopped reading deltas: {}", e);
                    break;
                }
            }
        }
        if let Err(e) = self.flush().await {
            warn!("[DeltaIngester] Final flush failed: {}", e);
        }
        info!("[DeltaIngester] Delta feed ended after {} deltas", count);
        count
    }

    /// Write whatever is buffered. Called on shutdown.
    pub async fn flush(&self) -> Result<()> {
        let batch = std::mem::take(&mut self.buffer()?.points);
        self.write_batch(batch).await;
        Ok(())
    }

    pub fn buffered(&self) -> usize {
        self.buffer().map(|b| b.points.len()).unwrap_or(0)
    }

    async fn write_batch(&self, batch: Vec<Point>) {
        if batch.is_empty() {
            return;
        }
        match self.series.write(&batch).await {
            Ok(()) => debug!("[DeltaIngester] Flushed {} points", batch.len()),
            Err(e) => warn!("[DeltaIngester] Dropped {} points: {}", batch.len(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::{FieldValue, MemoryTimeSeries};
    use async_trait::async_trait;
    use crate::timeseries::{AggregateQuery, RowSet};
    use serde_json::json;

    fn delta(context: Option<&str>, timestamp: &str, values: Value) -> Delta {
        let mut delta = json!({
            "updates": [{"timestamp": timestamp, "$source": "nmea0183.GP", "values": values}]
        });
        if let Some(context) = context {
            delta["context"] = json!(context);
        }
        serde_json::from_value(delta).unwrap()
    }

    fn ingester(config: StashConfig) -> (DeltaIngester, Arc<TrackStore>, Arc<MemoryTimeSeries>) {
        let tracks = Arc::new(TrackStore::in_memory().unwrap());
        let series = Arc::new(MemoryTimeSeries::new());
        (
            DeltaIngester::new(&config, tracks.clone(), series.clone()),
            tracks,
            series,
        )
    }

    fn position(lat: f64, lon: f64) -> Value {
        json!([{"path": "navigation.position", "value": {"latitude": lat, "longitude": lon}}])
    }

    #[test]
    fn test_parse_delta() {
        let d = Delta::from_json_str(
            r#"{"context":"vessels.urn:mrn:imo:mmsi:230099999","updates":[{"timestamp":"2018-06-01T12:00:00.000Z","$source":"n2k.115","values":[{"path":"propulsion.main.revolutions","value":12.5}]}]}"#,
        )
        .unwrap();
        assert_eq!(d.updates[0].source.as_deref(), Some("n2k.115"));
        assert_eq!(d.updates[0].values[0].value, json!(12.5));
        assert!(d.updates[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn test_position_goes_to_track_store_and_buffer() {
        let (ingester, tracks, _) = ingester(StashConfig::default());
        let report = ingester
            .write(&delta(None, "2018-06-01T12:00:00Z", position(60.1, 25.0)))
            .await
            .unwrap();

        assert_eq!(report.positions_stored, 1);
        assert_eq!(report.points_buffered, 1);
        assert_eq!(tracks.position_count().unwrap(), 1);
        assert_eq!(ingester.buffered(), 1);
    }

    #[tokio::test]
    async fn test_other_vessels_are_ignored() {
        let (ingester, tracks, _) = ingester(StashConfig::default());
        let report = ingester
            .write(&delta(Some("vessels.urn:mrn:imo:mmsi:1"), "2018-06-01T12:00:00Z", position(60.1, 25.0)))
            .await
            .unwrap();
        assert_eq!(report, IngestReport::default());
        assert_eq!(tracks.position_count().unwrap(), 0);

        let report = ingester
            .write(&delta(Some("vessels.self"), "2018-06-01T12:00:00Z", position(60.1, 25.0)))
            .await
            .unwrap();
        assert_eq!(report.positions_stored, 1);
    }

    #[tokio::test]
    async fn test_track_store_throttle_is_reported() {
        let (ingester, _, _) = ingester(StashConfig::default());
        ingester
            .write(&delta(None, "2018-06-01T12:00:00Z", position(60.1, 25.0)))
            .await
            .unwrap();
        let report = ingester
            .write(&delta(None, "2018-06-01T12:00:30Z", position(60.1, 25.0)))
            .await
            .unwrap();
        assert_eq!(report.positions_throttled, 1);
        // 30s apart passes the 1s position point throttle
        assert_eq!(report.points_buffered, 1);

        let report = ingester
            .write(&delta(None, "2018-06-01T12:00:30.500Z", position(60.1, 25.0)))
            .await
            .unwrap();
        assert_eq!(report.points_buffered, 0);
    }

    #[tokio::test]
    async fn test_numeric_values_respect_filter() {
        let config = StashConfig {
            black_or_white: crate::config::ListMode::Black,
            black_or_whitelist: vec!["environment.depth.belowKeel".to_string()],
            ..StashConfig::default()
        };
        let (ingester, _, _) = ingester(config);
        let values = json!([
            {"path": "propulsion.main.revolutions", "value": 12.5},
            {"path": "environment.depth.belowKeel", "value": 4.2},
            {"path": "navigation.state", "value": "sailing"}
        ]);
        let report = ingester
            .write(&delta(None, "2018-06-01T12:00:00Z", values))
            .await
            .unwrap();
        assert_eq!(report.points_buffered, 1);
    }

    #[tokio::test]
    async fn test_flush_at_batch_size() {
        let config = StashConfig {
            write_batch_size: 2,
            ..StashConfig::default()
        };
        let (ingester, _, series) = ingester(config);
        let one = json!([{"path": "propulsion.main.revolutions", "value": 12.5}]);
        ingester.write(&delta(None, "2018-06-01T12:00:00Z", one.clone())).await.unwrap();
        assert_eq!(series.point_count(), 0);
        ingester.write(&delta(None, "2018-06-01T12:00:01Z", one.clone())).await.unwrap();
        assert_eq!(series.point_count(), 2);
        assert_eq!(ingester.buffered(), 0);

        ingester.write(&delta(None, "2018-06-01T12:00:02Z", one)).await.unwrap();
        ingester.flush().await.unwrap();
        assert_eq!(series.point_count(), 3);
    }

    struct FailingStore;

    #[async_trait]
    impl TimeSeriesStore for FailingStore {
        async fn write(&self, _points: &[Point]) -> Result<()> {
            Err(StashError::collaborator("connection refused"))
        }
        async fn query(&self, _queries: &[AggregateQuery]) -> Result<Vec<RowSet>> {
            Err(StashError::collaborator("connection refused"))
        }
        async fn series_names(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed_and_buffer_cleared() {
        let config = StashConfig {
            write_batch_size: 1,
            ..StashConfig::default()
        };
        let tracks = Arc::new(TrackStore::in_memory().unwrap());
        let ingester = DeltaIngester::new(&config, tracks.clone(), Arc::new(FailingStore));
        let report = ingester
            .write(&delta(None, "2018-06-01T12:00:00Z", position(60.1, 25.0)))
            .await
            .unwrap();
        assert_eq!(report.positions_stored, 1);
        assert_eq!(ingester.buffered(), 0);
    }

    #[tokio::test]
    async fn test_track_store_failure_keeps_series_points() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("track.sqlite");
        let tracks = Arc::new(TrackStore::open(&path, Default::default()).unwrap());
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE trackdata")
            .unwrap();

        let config = StashConfig {
            write_batch_size: 1,
            ..StashConfig::default()
        };
        let series = Arc::new(MemoryTimeSeries::new());
        let ingester = DeltaIngester::new(&config, tracks.clone(), series.clone());
        let values = json!([
            {"path": "propulsion.revolutions", "value": 12.5},
            {"path": "navigation.position", "value": {"latitude": 60.1, "longitude": 25.0}},
            {"path": "environment.depth.belowKeel", "value": 4.2}
        ]);
        let report = ingester
            .write(&delta(None, "2018-06-01T12:00:00Z", values))
            .await
            .unwrap();

        assert_eq!(report.positions_failed, 1);
        assert_eq!(report.positions_stored, 0);
        assert_eq!(report.points_buffered, 3);
        assert_eq!(series.point_count(), 3);
        assert_eq!(tracks.track_count().unwrap(), 0);
    }

    fn line(value: f64) -> String {
        format!(
            "{{\"updates\":[{{\"timestamp\":\"2018-06-01T12:00:00Z\",\"values\":[{{\"path\":\"propulsion.revolutions\",\"value\":{}}}]}}]}}\n",
            value
        )
    }

    #[tokio::test]
    async fn test_consume_until_eof_then_flush() {
        let (ingester, _, series) = ingester(StashConfig::default());
        let input = format!("{}\n{}not json\n", line(1.0), line(2.0));
        let count = ingester
            .consume(tokio::io::BufReader::new(input.as_bytes()), &Notify::new())
            .await;
        assert_eq!(count, 3);
        assert_eq!(series.point_count(), 2);
        assert_eq!(ingester.buffered(), 0);
    }

    #[tokio::test]
    async fn test_consume_stops_on_shutdown_and_flushes() {
        use tokio::io::AsyncWriteExt;

        let (ingester, _, series) = ingester(StashConfig::default());
        let ingester = Arc::new(ingester);
        let shutdown = Arc::new(Notify::new());
        let (mut writer, reader) = tokio::io::duplex(1024);
        writer.write_all(line(12.5).as_bytes()).await.unwrap();

        let task = {
            let ingester = ingester.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                ingester
                    .consume(tokio::io::BufReader::new(reader), &shutdown)
                    .await
            })
        };
        while ingester.buffered() == 0 {
            tokio::task::yield_now().await;
        }
        shutdown.notify_one();

        assert_eq!(task.await.unwrap(), 1);
        assert_eq!(series.point_count(), 1);
        drop(writer);
    }

    #[tokio::test]
    async fn test_position_point_encoding() {
        let config = StashConfig {
            write_batch_size: 1,
            ..StashConfig::default()
        };
        let (ingester, _, series) = ingester(config);
        ingester
            .write(&delta(None, "2018-06-01T12:00:00Z", position(60.1, 25.0)))
            .await
            .unwrap();
        assert_eq!(series.series_names().await.unwrap(), vec!["navigation.position".to_string()]);
        assert_eq!(
            Point::position(None, 60.1, 25.0).value,
            FieldValue::Text("[25.0,60.1]".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalid_position_is_ignored() {
        let (ingester, tracks, _) = ingester(StashConfig::default());
        let values = json!([{"path": "navigation.position", "value": {"latitude": 95.0, "longitude": 25.0}}]);
        let report = ingester
            .write(&delta(None, "2018-06-01T12:00:00Z", values))
            .await
            .unwrap();
        assert_eq!(report, IngestReport::default());
        assert_eq!(tracks.position_count().unwrap(), 0);
    }
}
