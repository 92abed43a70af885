//! Session control endpoints

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::{ApiError, ApiState, error};
use crate::coordinator::{StartReport, StopReport};
use crate::dispatcher::BroadcastReport;
use crate::markers::SyncMarkerRecord;
use crate::protocol::MarkerKind;
use crate::session::Session;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBody {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Empty means every modality each node supports
    #[serde(default)]
    pub modalities: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopBody {
    /// Defaults to the open session
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MarkerBody {
    #[serde(default = "default_marker_kind")]
    pub kind: MarkerKind,
    #[serde(default)]
    pub description: String,
}

const fn default_marker_kind() -> MarkerKind {
    MarkerKind::Manual
}

/// The open session, or `null`
async fn current(State(state): State<Arc<ApiState>>) -> Result<Json<Option<Session>>, ApiError> {
    Ok(Json(state.coordinator.current_session().await?))
}

async fn start(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<StartBody>,
) -> Result<Json<StartReport>, ApiError> {
    let report = state
        .coordinator
        .start_session(body.session_id, body.modalities)
        .await?;
    Ok(Json(report))
}

async fn stop(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<StopBody>,
) -> Result<Json<StopReport>, ApiError> {
    Ok(Json(state.coordinator.stop_session(body.session_id).await?))
}

async fn marker(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<MarkerBody>,
) -> Result<Json<SyncMarkerRecord>, ApiError> {
    let record = state
        .coordinator
        .emit_marker(body.kind, body.description)
        .await?;
    Ok(Json(record))
}

async fn sync(State(state): State<Arc<ApiState>>) -> Json<BroadcastReport> {
    Json(state.coordinator.sync_clocks().await)
}

async fn archive(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.coordinator.sessions().archived().await?))
}

async fn get_session(
    State(state): State<Arc<ApiState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .coordinator
        .sessions()
        .get(&session_id)
        .await?
        .map(Json)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("session '{session_id}' not found")))
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(current))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/markers", post(marker))
        .route("/sync", post(sync))
        .route("/archive", get(archive))
        .route("/{session_id}", get(get_session))
        .with_state(state)
}
