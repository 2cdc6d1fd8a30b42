//! Unified error handling for the track-stash library.
//!
//! Every fallible operation returns [`StashError`]. The variants follow the
//! failure classes callers need to react to differently: bad input, a broken
//! ingestion call site, an unavailable track store, collaborator failures and
//! corrupt stored data.

use std::time::Duration;

use thiserror::Error;

/// Unified error type for track-stash operations.
#[derive(Debug, Error)]
pub enum StashError {
    /// Missing or malformed request input (surfaced as 400)
    #[error("{0}")]
    BadRequest(String),

    /// More than one position handed to a single ingestion call
    #[error("Can write only one position at a time, got {count}")]
    IngestionContractViolation { count: usize },

    /// Track database failed to open or is no longer usable
    #[error("Track store unavailable: {0}")]
    StoreUnavailable(String),

    /// SQLite error from the track database
    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Time-series store write or query failed
    #[error("Time-series store error: {message}")]
    Collaborator { message: String },

    /// Stored position encoding could not be parsed
    #[error("Corrupt position encoding {raw:?}: {message}")]
    DataCorruption { raw: String, message: String },

    /// Query exceeded its deadline
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON parsing error
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl StashError {
    /// Shorthand for a collaborator failure with a formatted message.
    pub fn collaborator(message: impl Into<String>) -> Self {
        StashError::Collaborator {
            message: message.into(),
        }
    }

    /// Whether the error was caused by the caller's input.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, StashError::BadRequest(_))
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for StashError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => StashError::collaborator(format!("HTTP {}: {}", status, err)),
            None => StashError::collaborator(err.to_string()),
        }
    }
}

/// Result type alias for track-stash operations.
pub type Result<T> = std::result::Result<T, StashError>;

/// Extension trait for converting Option to StashError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a bad request error.
    fn ok_or_bad_request(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_bad_request(self, message: &str) -> Result<T> {
        self.ok_or_else(|| StashError::BadRequest(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StashError::IngestionContractViolation { count: 2 };
        assert!(err.to_string().contains("only one position"));
        assert!(err.to_string().contains('2'));

        let err = StashError::BadRequest("No bbox".to_string());
        assert_eq!(err.to_string(), "No bbox");
        assert!(err.is_bad_request());
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_bad_request("missing");
        assert!(matches!(result, Err(StashError::BadRequest(ref m)) if m == "missing"));
        assert_eq!(Some(3).ok_or_bad_request("missing").unwrap(), 3);
    }
}
