//! Node registry endpoints

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use super::{ApiError, ApiState, error};
use crate::dispatcher::Outcome;
use crate::nodes::NodeSnapshot;
use crate::protocol::{CommandKind, CommandParams};

/// Per-node command request
///
/// Only commands that do not belong to a session are accepted here; START,
/// STOP and markers go through `/api/session`.
#[derive(Debug, Deserialize)]
pub struct CommandBody {
    pub command: CommandKind,
    #[serde(default)]
    pub modality: Option<String>,
}

impl CommandBody {
    fn params(self) -> Result<CommandParams, ApiError> {
        let modality = |m: Option<String>| {
            m.filter(|m| !m.trim().is_empty())
                .ok_or_else(|| error(StatusCode::BAD_REQUEST, "modality is required"))
        };
        match self.command {
            CommandKind::GetStatus => Ok(CommandParams::GetStatus),
            CommandKind::SyncTime => Ok(CommandParams::SyncTime { last_offset: None }),
            CommandKind::StartStream => Ok(CommandParams::StartStream {
                modality: modality(self.modality)?,
            }),
            CommandKind::StopStream => Ok(CommandParams::StopStream {
                modality: modality(self.modality)?,
            }),
            kind @ (CommandKind::Start | CommandKind::Stop | CommandKind::MarkEvent) => Err(error(
                StatusCode::BAD_REQUEST,
                format!("{kind} is session-scoped, use /api/session"),
            )),
        }
    }
}

async fn list_nodes(State(state): State<Arc<ApiState>>) -> Json<Vec<NodeSnapshot>> {
    Json(state.coordinator.nodes().await)
}

async fn get_node(
    State(state): State<Arc<ApiState>>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeSnapshot>, ApiError> {
    state
        .coordinator
        .node(&node_id)
        .await
        .map(Json)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("node '{node_id}' not found")))
}

/// Send one command and report its outcome
async fn command_node(
    State(state): State<Arc<ApiState>>,
    Path(node_id): Path<String>,
    Json(body): Json<CommandBody>,
) -> Result<(StatusCode, Json<Outcome>), ApiError> {
    let params = body.params()?;
    if state.coordinator.node(&node_id).await.is_none() {
        return Err(error(StatusCode::NOT_FOUND, format!("node '{node_id}' not found")));
    }

    let outcome = state.coordinator.send_command(&node_id, params).await;
    let code = match &outcome {
        Outcome::Acked(_) => StatusCode::OK,
        Outcome::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        Outcome::NotConnected => StatusCode::CONFLICT,
        Outcome::Failed { .. } => StatusCode::BAD_GATEWAY,
    };
    Ok((code, Json(outcome)))
}

/// Drop a node record and close its connection
async fn remove_node(
    State(state): State<Arc<ApiState>>,
    Path(node_id): Path<String>,
) -> Result<Json<NodeSnapshot>, ApiError> {
    state
        .coordinator
        .manager()
        .unregister(&node_id)
        .await
        .map(Json)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("node '{node_id}' not found")))
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_nodes))
        .route("/{node_id}", get(get_node).delete(remove_node))
        .route("/{node_id}/command", post(command_node))
        .with_state(state)
}
