//! Controller facade
//!
//! Wires the connection manager, dispatcher, session task, marker emitter
//! and telemetry hub together and exposes the operator-level operations.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::dispatcher::{BroadcastReport, DispatchPolicy, Dispatcher, Outcome};
use crate::error::SessionError;
use crate::markers::{MarkerEmitter, SyncMarkerRecord};
use crate::nodes::types::{ConnectionState, NodeEvent, NodeSnapshot};
use crate::nodes::{ConnectionManager, ConnectionSettings};
use crate::protocol::{Command, CommandParams, MarkerKind};
use crate::session::{NodeOutcome, Session, SessionHandle, SessionStatus, SessionSummary, StopPlan};
use crate::telemetry::TelemetryHub;

/// Result of starting a session
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub session: SessionSummary,
    pub report: BroadcastReport,
}

/// Result of stopping a session; `report` is absent for a no-op stop
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub session: SessionSummary,
    pub report: Option<BroadcastReport>,
}

/// `session_YYYYmmdd_HHMMSS` in local time
#[must_use]
pub fn default_session_id() -> String {
    format!("session_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"))
}

#[derive(Clone)]
pub struct Coordinator {
    config: Config,
    manager: ConnectionManager,
    dispatcher: Dispatcher,
    sessions: SessionHandle,
    markers: MarkerEmitter,
    hub: TelemetryHub,
}

impl Coordinator {
    /// Build the controller and start its session task
    pub async fn new(config: Config) -> Self {
        let manager = ConnectionManager::new(ConnectionSettings::from(&config));
        let dispatcher = Dispatcher::new(manager.clone(), DispatchPolicy::from(&config));
        let sessions = SessionHandle::spawn(manager.subscribe().await);
        let markers = MarkerEmitter::new(dispatcher.clone(), sessions.clone(), config.command_timeout());
        let hub = TelemetryHub::new(config.telemetry_buffer);

        Self {
            config,
            manager,
            dispatcher,
            sessions,
            markers,
            hub,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionHandle {
        &self.sessions
    }

    #[must_use]
    pub const fn hub(&self) -> &TelemetryHub {
        &self.hub
    }

    /// Open a session and broadcast START to every known node
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRecording` while another session is open
    pub async fn start_session(
        &self,
        session_id: Option<String>,
        modalities: Vec<String>,
    ) -> Result<StartReport, SessionError> {
        let session_id = session_id.unwrap_or_else(default_session_id);
        let targets: Vec<String> = self
            .manager
            .broadcast_targets()
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect();

        self.sessions
            .begin(session_id.clone(), &targets, modalities.clone())
            .await?;

        let command = Command::new(CommandParams::Start { modalities }).with_session(session_id.clone());
        let report = self
            .dispatcher
            .broadcast_to(&targets, command, self.config.start_timeout())
            .await;

        let outcomes = self.with_offsets(&report).await;
        let session = match self.sessions.start_resolved(&session_id, outcomes).await? {
            Some(session) => session,
            None => self
                .sessions
                .get(&session_id)
                .await?
                .ok_or(SessionError::NoActiveSession)?,
        };
        let summary = session.summary();

        tracing::info!(
            session_id = %session_id,
            status = %summary.status,
            "{}",
            report.summary()
        );
        if summary.status == SessionStatus::FailedToStart {
            self.retract_late_starts(&session_id, &report);
        }

        Ok(StartReport {
            session: summary,
            report,
        })
    }

    /// Nodes that timed out on START may still begin recording; tell them to stop
    fn retract_late_starts(&self, session_id: &str, report: &BroadcastReport) {
        let late: Vec<String> = report
            .outcomes
            .iter()
            .filter(|(_, o)| **o == Outcome::TimedOut)
            .map(|(id, _)| id.clone())
            .collect();
        if late.is_empty() {
            return;
        }

        tracing::warn!(session_id = %session_id, nodes = ?late, "session failed to start, retracting");
        let dispatcher = self.dispatcher.clone();
        let command = Command::new(CommandParams::Stop).with_session(session_id);
        let timeout = self.config.command_timeout();
        tokio::spawn(async move {
            dispatcher.broadcast_to(&late, command, timeout).await;
        });
    }

    /// Broadcast STOP for a session; `None` stops the open session
    ///
    /// STOP for an unknown session sends nothing.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session task is gone
    pub async fn stop_session(&self, session_id: Option<String>) -> Result<StopReport, SessionError> {
        let (session_id, targets) = match self.sessions.begin_stop(session_id).await? {
            StopPlan::NoOp { session_id } => {
                tracing::info!(session_id = %session_id, "stop requested for a session that is not open");
                return Ok(StopReport {
                    session: SessionSummary::no_op_stop(session_id),
                    report: None,
                });
            }
            StopPlan::Targets {
                session_id,
                targets,
            } => (session_id, targets),
        };

        let command = Command::new(CommandParams::Stop).with_session(session_id.clone());
        let report = self
            .dispatcher
            .broadcast_to(&targets, command, self.config.command_timeout())
            .await;

        let outcomes = self.with_offsets(&report).await;
        let session = match self.sessions.stop_resolved(&session_id, outcomes).await? {
            Some(session) => session,
            None => self
                .sessions
                .get(&session_id)
                .await?
                .ok_or(SessionError::NoActiveSession)?,
        };
        tracing::info!(session_id = %session_id, phase = ?session.phase, "{}", report.summary());

        Ok(StopReport {
            session: session.summary(),
            report: Some(report),
        })
    }

    async fn with_offsets(&self, report: &BroadcastReport) -> Vec<NodeOutcome> {
        let mut outcomes = Vec::with_capacity(report.len());
        for (node_id, outcome) in &report.outcomes {
            let offset = self.manager.offset(node_id).await;
            outcomes.push((node_id.clone(), outcome.clone(), offset));
        }
        outcomes
    }

    /// # Errors
    ///
    /// Returns `NoActiveSession` when no session is open
    pub async fn emit_marker(
        &self,
        kind: MarkerKind,
        description: impl Into<String>,
    ) -> Result<SyncMarkerRecord, SessionError> {
        self.markers.emit(kind, description).await
    }

    pub async fn sync_clocks(&self) -> BroadcastReport {
        self.dispatcher.sync_clocks().await
    }

    /// Send one command to one node with the default deadline
    pub async fn send_command(&self, node_id: &str, params: CommandParams) -> Outcome {
        let mut command = Command::new(params);
        if let Ok(Some(session)) = self.sessions.current().await {
            command = command.with_session(session.id);
        }
        self.dispatcher
            .send_to_one(node_id, command, self.config.command_timeout())
            .await
    }

    pub async fn nodes(&self) -> Vec<NodeSnapshot> {
        self.manager.list().await
    }

    pub async fn node(&self, node_id: &str) -> Option<NodeSnapshot> {
        self.manager.get(node_id).await
    }

    /// # Errors
    ///
    /// Returns `Closed` if the session task is gone
    pub async fn current_session(&self) -> Result<Option<Session>, SessionError> {
        self.sessions.current().await
    }

    /// Keep clocks fresh and telemetry streams tidy until shutdown
    ///
    /// Newly active nodes are synchronized at once; every node is
    /// resynchronized when its last accepted sample is older than the resync
    /// interval.
    pub async fn spawn_maintenance(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self.manager.subscribe().await;
        let coordinator = self.clone();
        tokio::spawn(async move {
            let interval = coordinator.config.resync_interval();
            let period = interval.max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => coordinator.on_node_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "maintenance lagged behind node events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        let due = coordinator.manager.resync_due(interval).await;
                        if !due.is_empty() {
                            let dispatcher = coordinator.dispatcher.clone();
                            tokio::spawn(async move {
                                dispatcher.sync_nodes(&due).await;
                            });
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("maintenance task stopped");
        })
    }

    async fn on_node_event(&self, event: NodeEvent) {
        match event {
            NodeEvent::StateChanged {
                node_id,
                from: ConnectionState::Registered,
                to: ConnectionState::Active,
                ..
            } => {
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.sync_nodes(&[node_id]).await;
                });
            }
            NodeEvent::Removed { node_id, .. } => {
                let dropped = self.hub.forget_node(&node_id).await;
                if dropped > 0 {
                    tracing::debug!(node_id = %node_id, streams = dropped, "telemetry streams dropped");
                }
            }
            NodeEvent::StateChanged { .. } => {}
        }
    }

    /// Archive the open session and close every connection
    pub async fn shutdown(&self) -> Option<Session> {
        let abandoned = match self.sessions.shutdown().await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "session task unavailable during shutdown");
                None
            }
        };
        if let Some(session) = &abandoned {
            tracing::warn!(
                session_id = %session.id,
                "open session archived at shutdown with unconfirmed nodes marked lost"
            );
        }
        self.manager.shutdown().await;
        abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_id_is_timestamped() {
        let id = default_session_id();
        assert!(id.starts_with("session_"));
        assert_eq!(id.len(), "session_20260101_120000".len());
    }

    #[tokio::test]
    async fn stop_before_start_is_no_op() {
        let coordinator = Coordinator::new(Config::default()).await;
        let stop = coordinator
            .stop_session(Some("never-started".to_string()))
            .await
            .unwrap();
        assert!(stop.report.is_none());
        assert_eq!(stop.session.confirmed, 0);
        assert_eq!(stop.session.session_id, "never-started");
    }

    #[tokio::test]
    async fn start_with_no_nodes_fails_to_start() {
        let coordinator = Coordinator::new(Config::default()).await;
        let start = coordinator.start_session(None, vec![]).await.unwrap();
        assert_eq!(start.session.status, SessionStatus::FailedToStart);
        assert!(start.report.is_empty());
        assert!(coordinator.current_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn marker_without_session_is_rejected() {
        let coordinator = Coordinator::new(Config::default()).await;
        let err = coordinator
            .emit_marker(MarkerKind::Manual, "flash")
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NoActiveSession);
    }
}
