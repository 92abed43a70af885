//! HTTP API for operators
//!
//! Thin JSON layer over the [`Coordinator`]; every handler delegates to a
//! controller operation.

pub mod health;
pub mod nodes;
pub mod session;
pub mod telemetry;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::error::SessionError;
use crate::{Error, Result};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Coordinator,
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

pub(crate) fn error(code: StatusCode, message: impl Into<String>) -> ApiError {
    (
        code,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let code = match e {
            SessionError::AlreadyRecording(_) | SessionError::NoActiveSession => StatusCode::CONFLICT,
            SessionError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        };
        error(code, e.to_string())
    }
}

/// Build the router with all routes
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api/nodes", nodes::router(state.clone()))
        .nest("/api/session", session::router(state.clone()))
        .nest("/api/telemetry", telemetry::router(state.clone()))
        .merge(health::router())
        .merge(health::status_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    bind: String,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub fn new(coordinator: Coordinator, bind: impl Into<String>, port: u16) -> Self {
        Self {
            state: Arc::new(ApiState { coordinator }),
            bind: bind.into(),
            port,
        }
    }

    /// Run the API server until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.bind, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
