//! InfluxDB 1.x client implementing [`TimeSeriesStore`].
//!
//! - Database is created on first use if missing
//! - Writes use line protocol with millisecond precision
//! - All statements of one track query go out as a single `/query` request,
//!   with time bounds passed as bind parameters
//! - Statement results are mapped back by `statement_id`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use crate::config::InfluxConfig;
use crate::error::{Result, StashError};
use crate::timeseries::{AggregateQuery, BucketRow, FieldValue, Point, RowSet, TimeSeriesStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    statement_id: usize,
    #[serde(default)]
    series: Vec<Series>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

// ============================================================================
// Client
// ============================================================================

pub struct InfluxClient {
    client: Client,
    base_url: String,
    database: String,
    ready: OnceCell<()>,
}

impl InfluxClient {
    pub fn new(config: &InfluxConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StashError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: format!("{}://{}:{}", config.protocol, config.host, config.port),
            database: config.database.clone(),
            ready: OnceCell::new(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Create the database on first use if the server does not have it.
    async fn ensure_database(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                let names = self.series_column("SHOW DATABASES", None).await?;
                if names.iter().any(|n| n == &self.database) {
                    debug!("[InfluxClient] Connected, database {} exists", self.database);
                } else {
                    let statement = format!("CREATE DATABASE {}", crate::timeseries::quote_identifier(&self.database));
                    self.raw_query(&statement, None, None).await?;
                    info!("[InfluxClient] Created InfluxDb database {}", self.database);
                }
                Ok::<(), StashError>(())
            })
            .await
            .map(|_| ())
    }

    async fn raw_query(
        &self,
        statement: &str,
        database: Option<&str>,
        params: Option<&Map<String, Value>>,
    ) -> Result<QueryResponse> {
        let mut form: Vec<(&str, String)> = vec![("q", statement.to_string()), ("epoch", "ms".to_string())];
        if let Some(db) = database {
            form.push(("db", db.to_string()));
        }
        if let Some(params) = params {
            form.push(("params", Value::Object(params.clone()).to_string()));
        }

        let resp = self
            .client
            .post(format!("{}/query", self.base_url))
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        let body: QueryResponse = resp.json().await.map_err(|e| {
            StashError::collaborator(format!("Unparseable query response (HTTP {}): {}", status, e))
        })?;
        if let Some(error) = &body.error {
            return Err(StashError::collaborator(error.clone()));
        }
        if !status.is_success() {
            return Err(StashError::collaborator(format!("HTTP {}", status)));
        }
        Ok(body)
    }

    /// First column of every row of a single-statement SHOW query.
    async fn series_column(&self, statement: &str, database: Option<&str>) -> Result<Vec<String>> {
        let response = self.raw_query(statement, database, None).await?;
        let mut names = Vec::new();
        for result in &response.results {
            if let Some(error) = &result.error {
                return Err(StashError::collaborator(error.clone()));
            }
            for series in &result.series {
                names.extend(
                    series
                        .values
                        .iter()
                        .filter_map(|row| row.first().and_then(Value::as_str).map(String::from)),
                );
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl TimeSeriesStore for InfluxClient {
    async fn write(&self, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        self.ensure_database().await?;

        let body = points.iter().map(to_line_protocol).collect::<Vec<_>>().join("\n");
        let resp = self
            .client
            .post(format!("{}/write", self.base_url))
            .query(&[("db", self.database.as_str()), ("precision", "ms")])
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StashError::collaborator(format!("Write failed (HTTP {}): {}", status, text)));
        }
        debug!("[InfluxClient] Wrote {} points", points.len());
        Ok(())
    }

    async fn query(&self, queries: &[AggregateQuery]) -> Result<Vec<RowSet>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_database().await?;

        let mut params = Map::new();
        let statements: Vec<String> = queries
            .iter()
            .enumerate()
            .map(|(n, q)| {
                q.bind_params(n, &mut params);
                q.statement(n)
            })
            .collect();
        let statement = statements.join("; ");
        debug!("[InfluxClient] {} statements: {}", statements.len(), statement);

        let response = self.raw_query(&statement, Some(&self.database), Some(&params)).await?;
        rows_in_submission_order(response, queries.len())
    }

    async fn series_names(&self) -> Result<Vec<String>> {
        self.ensure_database().await?;
        self.series_column("SHOW MEASUREMENTS", Some(&self.database)).await
    }
}

// ============================================================================
// Encoding / Decoding
// ============================================================================

fn escape_measurement(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, ',' | ' ' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn escape_string_field(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Line protocol for one point: `measurement value=<v> [<epoch ms>]`.
fn to_line_protocol(point: &Point) -> String {
    let field = match &point.value {
        FieldValue::Number(n) => format!("{}", n),
        FieldValue::Text(s) => format!("\"{}\"", escape_string_field(s)),
    };
    match point.timestamp {
        Some(ts) => format!(
            "{} value={} {}",
            escape_measurement(&point.measurement),
            field,
            ts.timestamp_millis()
        ),
        None => format!("{} value={}", escape_measurement(&point.measurement), field),
    }
}

/// Turn a multi-statement response into one row set per submitted query.
fn rows_in_submission_order(response: QueryResponse, expected: usize) -> Result<Vec<RowSet>> {
    let mut slots: Vec<Option<RowSet>> = vec![None; expected];

    for result in response.results {
        if let Some(error) = result.error {
            return Err(StashError::collaborator(format!(
                "statement {}: {}",
                result.statement_id, error
            )));
        }
        let slot = slots.get_mut(result.statement_id).ok_or_else(|| {
            StashError::collaborator(format!(
                "unexpected statement id {} for {} queries",
                result.statement_id, expected
            ))
        })?;
        let mut rows = Vec::new();
        for series in &result.series {
            rows.extend(parse_series(series)?);
        }
        *slot = Some(rows);
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(n, slot)| {
            slot.ok_or_else(|| StashError::collaborator(format!("missing result for statement {}", n)))
        })
        .collect()
}

fn parse_series(series: &Series) -> Result<Vec<BucketRow>> {
    let column = |name: &str| series.columns.iter().position(|c| c == name);
    let time_col = column("time")
        .ok_or_else(|| StashError::collaborator("series without time column"))?;
    let value_col = column("value");
    let position_col = column("position");

    series
        .values
        .iter()
        .map(|row| {
            let millis = row
                .get(time_col)
                .and_then(Value::as_i64)
                .ok_or_else(|| StashError::collaborator("row without epoch time"))?;
            let time: DateTime<Utc> = DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| StashError::collaborator(format!("time {} out of range", millis)))?;
            Ok(BucketRow {
                time,
                value: value_col.and_then(|i| row.get(i)).and_then(Value::as_f64),
                position: position_col
                    .and_then(|i| row.get(i))
                    .and_then(Value::as_str)
                    .map(String::from),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_line_protocol() {
        let ts = Utc.timestamp_millis_opt(1_527_854_400_000).unwrap();
        assert_eq!(
            to_line_protocol(&Point::number("propulsion.main.revolutions", Some(ts), 13.5)),
            "propulsion.main.revolutions value=13.5 1527854400000"
        );
        assert_eq!(
            to_line_protocol(&Point::position(None, 60.1, 25.0)),
            "navigation.position value=\"[25.0,60.1]\""
        );
        assert_eq!(escape_measurement("a b,c"), "a\\ b\\,c");
    }

    #[test]
    fn test_parse_response_in_statement_order() {
        let json = r#"{
            "results": [
                {"statement_id": 1, "series": [{"name": "propulsion.revolutions", "columns": ["time", "value"], "values": [[1527854460000, 12.5], [1527854520000, null]]}]},
                {"statement_id": 0, "series": [{"name": "navigation.position", "columns": ["time", "position"], "values": [[1527854400000, "[25.0,60.1]"]]}]},
                {"statement_id": 2}
            ]
        }"#;
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        let results = rows_in_submission_order(response, 3).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0][0].position.as_deref(), Some("[25.0,60.1]"));
        assert_eq!(results[0][0].time.timestamp_millis(), 1_527_854_400_000);
        assert_eq!(results[1][0].value, Some(12.5));
        assert_eq!(results[1][1].value, None);
        assert!(results[2].is_empty());
    }

    #[test]
    fn test_statement_error_fails_whole_batch() {
        let json = r#"{"results": [{"statement_id": 0, "error": "measurement not found"}]}"#;
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(
            rows_in_submission_order(response, 1),
            Err(StashError::Collaborator { .. })
        ));
    }

    #[test]
    fn test_missing_statement_result_is_error() {
        let json = r#"{"results": [{"statement_id": 0}]}"#;
        let response: QueryResponse = serde_json::from_str(json).unwrap();
        assert!(rows_in_submission_order(response, 2).is_err());
    }

    #[test]
    fn test_client_base_url() {
        let client = InfluxClient::new(&InfluxConfig::default()).unwrap();
        assert_eq!(client.base_url, "http://localhost:8086");
        assert_eq!(client.database(), "signalk");
    }
}
