//! Period resolution: folds timestamp-ordered track rows into one time
//! window per track.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::persistence::TrackRow;

/// Time window of one track's positions inside a query region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPeriod {
    /// Track uuid
    pub id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Group rows by track uuid, keeping the order in which tracks first appear.
///
/// `start` is the first row's timestamp; `end` is the last row's timestamp
/// plus `min_interval_ms`, so a track with a single sample still yields a
/// window of non-zero width.
pub fn resolve_periods(rows: &[TrackRow], min_interval_ms: i64) -> Vec<TrackPeriod> {
    let mut order: Vec<(&str, i64, i64)> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for row in rows {
        match index.get(row.uuid.as_str()) {
            Some(&i) => order[i].2 = row.timestamp,
            None => {
                index.insert(row.uuid.as_str(), order.len());
                order.push((row.uuid.as_str(), row.timestamp, row.timestamp));
            }
        }
    }

    order
        .into_iter()
        .filter_map(|(uuid, first, last)| {
            let start = DateTime::from_timestamp_millis(first);
            let end = DateTime::from_timestamp_millis(last.saturating_add(min_interval_ms));
            match (start, end) {
                (Some(start), Some(end)) => Some(TrackPeriod {
                    id: uuid.to_string(),
                    start,
                    end,
                }),
                _ => {
                    warn!(
                        "[PeriodResolver] Track {} has out-of-range timestamps {}..{}",
                        uuid, first, last
                    );
                    None
                }
            }
        })
        .collect()
}
