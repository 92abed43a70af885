//! Telemetry stream discovery

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use super::{ApiError, ApiState, error};
use crate::telemetry::StreamInfo;

async fn list_streams(State(state): State<Arc<ApiState>>) -> Json<Vec<StreamInfo>> {
    Json(state.coordinator.hub().streams().await)
}

async fn get_stream(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<StreamInfo>, ApiError> {
    state
        .coordinator
        .hub()
        .stream(&name)
        .await
        .map(Json)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("stream '{name}' not found")))
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/streams", get(list_streams))
        .route("/streams/{name}", get(get_stream))
        .with_state(state)
}
