//! Health and status endpoints

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use super::{ApiError, ApiState};
use crate::session::SessionSummary;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Controller overview
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version: &'static str,
    pub nodes: usize,
    pub reachable_nodes: usize,
    pub synchronized_nodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSummary>,
}

/// Liveness probe
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<Arc<ApiState>>) -> Result<Json<StatusResponse>, ApiError> {
    let nodes = state.coordinator.nodes().await;
    let session = state.coordinator.current_session().await?;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        nodes: nodes.len(),
        reachable_nodes: nodes.iter().filter(|n| n.state.is_reachable()).count(),
        synchronized_nodes: nodes.iter().filter(|n| n.clock.is_synchronized()).count(),
        session: session.map(|s| s.summary()),
    }))
}

pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

pub fn status_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .with_state(state)
}
