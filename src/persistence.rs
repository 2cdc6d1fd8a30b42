//! # Track Store
//!
//! SQLite-backed storage for vessel positions grouped into tracks.
//!
//! ## Ingestion
//!
//! Positions are throttled to one per minimum write interval. A new track is
//! opened on the first stored sample and whenever the gap since the last
//! stored sample exceeds the track cutoff; otherwise the current track is
//! reused. The segmentation state lives in this store instance and every
//! ingestion call holds its lock for the whole read-decide-write step.
//!
//! ## Queries
//!
//! Every position is stored with a full-precision geohash, so a map region is
//! answered by prefix-matching the region's covering cells.
//!
//! ## Degraded mode
//!
//! [`TrackStore::open_or_degraded`] logs a failed open once and returns a
//! store without a database: queries return no rows and ingestion is a no-op.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::SecondsFormat;
use log::{debug, error, info};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StashError};
use crate::geohash;
use crate::periods::{resolve_periods, TrackPeriod};
use crate::types::{BoundingBox, PositionSample};

/// Minimum spacing between stored positions (1 minute).
pub const MIN_WRITE_INTERVAL_MS: i64 = 60 * 1000;

/// Gap after which a new track is started (20 minutes).
pub const TRACK_CUTOFF_INTERVAL_MS: i64 = 20 * 60 * 1000;

// ============================================================================
// Types
// ============================================================================

/// Throttling and segmentation intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackStoreConfig {
    /// Samples closer than this to the last stored one are dropped
    pub min_interval_ms: i64,
    /// Gaps longer than this start a new track
    pub track_cutoff_ms: i64,
}

impl Default for TrackStoreConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: MIN_WRITE_INTERVAL_MS,
            track_cutoff_ms: TRACK_CUTOFF_INTERVAL_MS,
        }
    }
}

/// A persisted track record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: i64,
    pub uuid: String,
    pub name: String,
}

/// A persisted position row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPosition {
    pub track_id: i64,
    /// Epoch milliseconds
    pub timestamp: i64,
    pub geohash: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Spatial query result row: a position timestamp joined to its track uuid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRow {
    pub timestamp: i64,
    pub uuid: String,
}

/// What an ingestion call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Position written to `track_id`; `new_track` when this sample opened it
    Stored { track_id: i64, new_track: bool },
    /// Sample arrived within the minimum write interval and was dropped
    Throttled,
    /// Nothing to do: empty input or the store is unavailable
    Skipped,
}

/// Statistics for the track store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStoreStats {
    pub available: bool,
    pub track_count: u32,
    pub position_count: u32,
    pub current_track_id: Option<i64>,
    pub last_write_millis: i64,
}

/// Segmentation state owned by one store instance.
#[derive(Debug, Default)]
struct SegmentState {
    last_write: i64,
    current_track: Option<i64>,
}

// ============================================================================
// Track Store
// ============================================================================

pub struct TrackStore {
    /// Database connection, None when the store failed to open
    db: Option<Mutex<Connection>>,

    /// Single-writer segmentation state
    state: Mutex<SegmentState>,

    config: TrackStoreConfig,
}

impl TrackStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) the track database at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: TrackStoreConfig) -> Result<Self> {
        let db = Connection::open(path.as_ref())?;
        Self::init_schema(&db)?;
        info!("[TrackStore] Opened track db {}", path.as_ref().display());
        Ok(Self::with_connection(Some(db), config))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_config(TrackStoreConfig::default())
    }

    pub fn in_memory_with_config(config: TrackStoreConfig) -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self::with_connection(Some(db), config))
    }

    /// Open the database, falling back to a store without storage if that
    /// fails. The failure is logged here and nowhere else.
    pub fn open_or_degraded<P: AsRef<Path>>(path: P, config: TrackStoreConfig) -> Self {
        match Self::open(path.as_ref(), config) {
            Ok(store) => store,
            Err(e) => {
                error!(
                    "[TrackStore] Failed to open track db {}: {}; tracks disabled",
                    path.as_ref().display(),
                    e
                );
                Self::with_connection(None, config)
            }
        }
    }

    fn with_connection(db: Option<Connection>, config: TrackStoreConfig) -> Self {
        Self {
            db: db.map(Mutex::new),
            state: Mutex::new(SegmentState::default()),
            config,
        }
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS track (
                id INTEGER PRIMARY KEY,
                name TEXT,
                uuid TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trackdata (
                track INTEGER NOT NULL REFERENCES track(id),
                timestamp INTEGER NOT NULL,
                geohash TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trackdata_geohash ON trackdata(geohash);
            CREATE INDEX IF NOT EXISTS idx_trackdata_track ON trackdata(track);
            "#,
        )?;
        Ok(())
    }

    pub fn config(&self) -> TrackStoreConfig {
        self.config
    }

    pub fn is_available(&self) -> bool {
        self.db.is_some()
    }

    fn connection(&self) -> Result<Option<MutexGuard<'_, Connection>>> {
        match &self.db {
            Some(db) => db
                .lock()
                .map(Some)
                .map_err(|_| StashError::StoreUnavailable("track db lock poisoned".to_string())),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Ingest position samples. Exactly one sample per call is accepted; an
    /// empty slice is a no-op and more than one is rejected without touching
    /// any state.
    pub fn ingest(&self, samples: &[PositionSample]) -> Result<IngestOutcome> {
        match samples {
            [] => Ok(IngestOutcome::Skipped),
            [sample] => self.ingest_one(sample),
            _ => Err(StashError::IngestionContractViolation {
                count: samples.len(),
            }),
        }
    }

    /// Throttle, segment and persist a single sample.
    pub fn ingest_one(&self, sample: &PositionSample) -> Result<IngestOutcome> {
        if self.db.is_none() {
            return Ok(IngestOutcome::Skipped);
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| StashError::StoreUnavailable("segment state lock poisoned".to_string()))?;

        let timestamp = sample.timestamp_millis();
        let gap = timestamp.saturating_sub(state.last_write);
        if gap <= self.config.min_interval_ms {
            return Ok(IngestOutcome::Throttled);
        }

        let Some(conn) = self.connection()? else {
            return Ok(IngestOutcome::Skipped);
        };

        // A new track row only survives together with its first position
        let tx = conn.unchecked_transaction()?;
        let (track_id, new_track) = match state.current_track {
            Some(id) if gap <= self.config.track_cutoff_ms => (id, false),
            _ => (Self::create_track(&tx, sample)?, true),
        };

        tx.execute(
            "INSERT INTO trackdata (track, timestamp, geohash, latitude, longitude)
             VALUES (?, ?, ?, ?, ?)",
            params![
                track_id,
                timestamp,
                geohash::encode(sample.latitude, sample.longitude),
                sample.latitude,
                sample.longitude
            ],
        )?;
        tx.commit()?;

        state.last_write = timestamp;
        state.current_track = Some(track_id);

        Ok(IngestOutcome::Stored {
            track_id,
            new_track,
        })
    }

    fn create_track(conn: &Connection, sample: &PositionSample) -> Result<i64> {
        let uuid = Uuid::new_v4().to_string();
        let name = sample.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
        conn.execute(
            "INSERT INTO track (name, uuid) VALUES (?, ?)",
            params![name, uuid],
        )?;
        let id = conn.last_insert_rowid();
        info!("[TrackStore] Started track {} ({}) at {}", id, uuid, name);
        Ok(id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Rows inside the region's covering cells, ordered by timestamp.
    pub fn query(&self, bbox: &BoundingBox) -> Result<Vec<TrackRow>> {
        self.query_prefixes(&geohash::covering_prefixes(bbox))
    }

    /// Rows whose geohash starts with any of `prefixes`, ordered by timestamp.
    pub fn query_prefixes(&self, prefixes: &[String]) -> Result<Vec<TrackRow>> {
        let Some(conn) = self.connection()? else {
            return Ok(Vec::new());
        };
        if prefixes.is_empty() {
            return Ok(Vec::new());
        }

        let clause = vec!["trackdata.geohash GLOB ?"; prefixes.len()].join(" OR ");
        let sql = format!(
            "SELECT trackdata.timestamp, track.uuid
             FROM trackdata
             INNER JOIN track ON trackdata.track = track.id
             WHERE {}
             ORDER BY trackdata.timestamp",
            clause
        );
        debug!("[TrackStore] Querying {} prefixes", prefixes.len());

        let patterns = prefixes.iter().map(|p| format!("{}*", p));
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(patterns), |row| {
                Ok(TrackRow {
                    timestamp: row.get(0)?,
                    uuid: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Time periods of every track passing through the region.
    pub fn get_periods(&self, bbox: &BoundingBox) -> Result<Vec<TrackPeriod>> {
        let rows = self.query(bbox)?;
        Ok(resolve_periods(&rows, self.config.min_interval_ms))
    }

    /// All tracks, oldest first.
    pub fn tracks(&self) -> Result<Vec<Track>> {
        let Some(conn) = self.connection()? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare("SELECT id, uuid, name FROM track ORDER BY id")?;
        let tracks = stmt
            .query_map([], |row| {
                Ok(Track {
                    id: row.get(0)?,
                    uuid: row.get(1)?,
                    name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tracks)
    }

    /// Positions of one track in time order.
    pub fn positions_for_track(&self, track_id: i64) -> Result<Vec<StoredPosition>> {
        let Some(conn) = self.connection()? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(
            "SELECT track, timestamp, geohash, latitude, longitude
             FROM trackdata WHERE track = ? ORDER BY timestamp",
        )?;
        let positions = stmt
            .query_map(params![track_id], |row| {
                Ok(StoredPosition {
                    track_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    geohash: row.get(2)?,
                    latitude: row.get(3)?,
                    longitude: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(positions)
    }

    pub fn track_count(&self) -> Result<u32> {
        self.count("SELECT COUNT(*) FROM track")
    }

    pub fn position_count(&self) -> Result<u32> {
        self.count("SELECT COUNT(*) FROM trackdata")
    }

    fn count(&self, sql: &str) -> Result<u32> {
        let Some(conn) = self.connection()? else {
            return Ok(0);
        };
        let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as u32)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Get store statistics.
    pub fn stats(&self) -> Result<TrackStoreStats> {
        let (current_track_id, last_write_millis) = {
            let state = self.state.lock().map_err(|_| {
                StashError::StoreUnavailable("segment state lock poisoned".to_string())
            })?;
            (state.current_track, state.last_write)
        };
        Ok(TrackStoreStats {
            available: self.is_available(),
            track_count: self.track_count()?,
            position_count: self.position_count()?,
            current_track_id,
            last_write_millis,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
