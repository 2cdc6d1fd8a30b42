//! HTTP surface for the track and series endpoints.
//!
//! Routes are mounted under `/signalk/v1`:
//! - `GET /vessels/self/tracks?bbox=..&paths=..` GeoJSON tracks
//! - `GET /vessels/self/data/series` known series

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::error;
use serde::Serialize;

use crate::error::StashError;
use crate::service::{TrackQuery, TrackService};

pub const API_PREFIX: &str = "/signalk/v1";
pub const GEO_JSON: &str = "application/vnd.geo+json";

/// Build the router with all routes under [`API_PREFIX`].
pub fn build_router(service: Arc<TrackService>) -> Router {
    let api = Router::new()
        .route("/vessels/self/tracks", get(tracks))
        .route("/vessels/self/data/series", get(series))
        .with_state(service);
    Router::new().nest(API_PREFIX, api)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Error paired with the request it failed for.
struct QueryFailure {
    error: StashError,
    query: TrackQuery,
}

impl IntoResponse for QueryFailure {
    fn into_response(self) -> Response {
        if self.error.is_bad_request() {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: self.error.to_string(),
                }),
            )
                .into_response();
        }

        let message = format!(
            "{} bbox={}&paths={}",
            self.error,
            self.query.bbox.as_deref().unwrap_or_default(),
            self.query.paths.as_deref().unwrap_or_default()
        );
        error!("[Server] {}", message);
        (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
    }
}

async fn tracks(
    State(service): State<Arc<TrackService>>,
    Query(query): Query<TrackQuery>,
) -> Response {
    match service.tracks(&query).await {
        Ok(collection) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, GEO_JSON)],
            Json(collection),
        )
            .into_response(),
        Err(error) => QueryFailure { error, query }.into_response(),
    }
}

async fn series(State(service): State<Arc<TrackService>>) -> Response {
    match service.series().await {
        Ok(series) => Json(series).into_response(),
        Err(error) => {
            error!("[Server] Series listing failed: {}", error);
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}
