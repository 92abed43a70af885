//! Single owner of session state
//!
//! Every session transition goes through one task. Dispatch results and
//! node-loss events are applied in arrival order, so concurrent operator
//! requests never interleave inside a transition.

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::clock;
use crate::dispatcher::Outcome;
use crate::error::SessionError;
use crate::markers::SyncMarkerRecord;
use crate::nodes::types::{ConnectionState, NodeEvent};

use super::state::{Session, SessionPhase};

/// Outcome for one node plus its clock offset at acknowledgment time
pub type NodeOutcome = (String, Outcome, Option<f64>);

/// What STOP should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopPlan {
    /// No matching open session
    NoOp { session_id: String },
    Targets {
        session_id: String,
        targets: Vec<String>,
    },
}

enum Request {
    Begin {
        session: Session,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StartResolved {
        session_id: String,
        outcomes: Vec<NodeOutcome>,
        reply: oneshot::Sender<Option<Session>>,
    },
    BeginStop {
        session_id: Option<String>,
        reply: oneshot::Sender<StopPlan>,
    },
    StopResolved {
        session_id: String,
        outcomes: Vec<NodeOutcome>,
        reply: oneshot::Sender<Option<Session>>,
    },
    RecordMarker {
        marker: SyncMarkerRecord,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Current {
        reply: oneshot::Sender<Option<Session>>,
    },
    Get {
        session_id: String,
        reply: oneshot::Sender<Option<Session>>,
    },
    Archived {
        reply: oneshot::Sender<Vec<Session>>,
    },
    Shutdown {
        reply: oneshot::Sender<Option<Session>>,
    },
}

/// Cheap handle to the session task
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Request>,
}

impl SessionHandle {
    /// Spawn the session task, following node events from the registry
    #[must_use]
    pub fn spawn(node_events: broadcast::Receiver<NodeEvent>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run(rx, node_events));
        Self { tx }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Open a new session with every target in REQUESTED
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRecording` while another session is open
    pub async fn begin(
        &self,
        session_id: impl Into<String>,
        targets: &[String],
        modalities: Vec<String>,
    ) -> Result<(), SessionError> {
        let session = Session::begin(session_id, targets, modalities, clock::now_seconds());
        self.call(|reply| Request::Begin { session, reply }).await?
    }

    /// Fold START outcomes and close the START window
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session task is gone
    pub async fn start_resolved(
        &self,
        session_id: &str,
        outcomes: Vec<NodeOutcome>,
    ) -> Result<Option<Session>, SessionError> {
        let session_id = session_id.to_string();
        self.call(|reply| Request::StartResolved {
            session_id,
            outcomes,
            reply,
        })
        .await
    }

    /// Move the session to STOPPING; `None` means the open session
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session task is gone
    pub async fn begin_stop(&self, session_id: Option<String>) -> Result<StopPlan, SessionError> {
        self.call(|reply| Request::BeginStop { session_id, reply }).await
    }

    /// Fold STOP outcomes and close the session if every node is resolved
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session task is gone
    pub async fn stop_resolved(
        &self,
        session_id: &str,
        outcomes: Vec<NodeOutcome>,
    ) -> Result<Option<Session>, SessionError> {
        let session_id = session_id.to_string();
        self.call(|reply| Request::StopResolved {
            session_id,
            outcomes,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// Returns `NoActiveSession` when no session is open
    pub async fn record_marker(&self, marker: SyncMarkerRecord) -> Result<(), SessionError> {
        self.call(|reply| Request::RecordMarker { marker, reply }).await?
    }

    /// The open session, if any
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session task is gone
    pub async fn current(&self) -> Result<Option<Session>, SessionError> {
        self.call(|reply| Request::Current { reply }).await
    }

    /// Look up an open or archived session
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session task is gone
    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        let session_id = session_id.to_string();
        self.call(|reply| Request::Get { session_id, reply }).await
    }

    /// Closed sessions, oldest first
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session task is gone
    pub async fn archived(&self) -> Result<Vec<Session>, SessionError> {
        self.call(|reply| Request::Archived { reply }).await
    }

    /// Archive the open session with unresolved nodes marked lost
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the session task is gone
    pub async fn shutdown(&self) -> Result<Option<Session>, SessionError> {
        self.call(|reply| Request::Shutdown { reply }).await
    }
}

#[derive(Default)]
struct Sessions {
    current: Option<Session>,
    archive: Vec<Session>,
}

impl Sessions {
    fn matching(&mut self, session_id: &str) -> Option<&mut Session> {
        self.current.as_mut().filter(|s| s.id == session_id)
    }

    /// Move the current session to the archive once it has closed
    fn archive_if_closed(&mut self) {
        if self.current.as_ref().is_some_and(|s| !s.is_open()) {
            if let Some(session) = self.current.take() {
                tracing::info!(
                    session_id = %session.id,
                    status = %session.status(),
                    "session closed"
                );
                self.archive.push(session);
            }
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Begin { session, reply } => {
                let result = match &self.current {
                    Some(open) => Err(SessionError::AlreadyRecording(open.id.clone())),
                    None => {
                        tracing::info!(
                            session_id = %session.id,
                            targets = session.nodes.len(),
                            "session starting"
                        );
                        self.current = Some(session);
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            Request::StartResolved {
                session_id,
                outcomes,
                reply,
            } => {
                let snapshot = self.matching(&session_id).map(|session| {
                    for (node_id, outcome, offset) in &outcomes {
                        session.apply_start_outcome(node_id, outcome, *offset);
                    }
                    session.finish_start(clock::now_seconds());
                    session.clone()
                });
                self.archive_if_closed();
                let _ = reply.send(snapshot);
            }
            Request::BeginStop { session_id, reply } => {
                let plan = match self.current.as_mut() {
                    Some(session) if session_id.as_deref().is_none_or(|id| id == session.id) => {
                        StopPlan::Targets {
                            session_id: session.id.clone(),
                            targets: session.begin_stop(clock::now_seconds()),
                        }
                    }
                    _ => StopPlan::NoOp {
                        session_id: session_id.unwrap_or_default(),
                    },
                };
                let _ = reply.send(plan);
            }
            Request::StopResolved {
                session_id,
                outcomes,
                reply,
            } => {
                let snapshot = self.matching(&session_id).map(|session| {
                    for (node_id, outcome, offset) in &outcomes {
                        session.apply_stop_outcome(node_id, outcome, *offset);
                    }
                    session.try_close(clock::now_seconds());
                    session.clone()
                });
                self.archive_if_closed();
                let _ = reply.send(snapshot);
            }
            Request::RecordMarker { marker, reply } => {
                let result = match self.current.as_mut() {
                    Some(session) => {
                        session.record_marker(marker);
                        Ok(())
                    }
                    None => Err(SessionError::NoActiveSession),
                };
                let _ = reply.send(result);
            }
            Request::Current { reply } => {
                let _ = reply.send(self.current.clone());
            }
            Request::Get { session_id, reply } => {
                let found = self
                    .current
                    .iter()
                    .chain(self.archive.iter().rev())
                    .find(|s| s.id == session_id)
                    .cloned();
                let _ = reply.send(found);
            }
            Request::Archived { reply } => {
                let _ = reply.send(self.archive.clone());
            }
            Request::Shutdown { reply } => {
                let abandoned = self.current.as_mut().map(|session| {
                    session.abandon(clock::now_seconds());
                    session.clone()
                });
                self.archive_if_closed();
                let _ = reply.send(abandoned);
            }
        }
    }

    fn on_node_event(&mut self, event: &NodeEvent) {
        let lost = match event {
            NodeEvent::StateChanged { to, .. } => *to == ConnectionState::Lost,
            NodeEvent::Removed { .. } => true,
        };
        if !lost {
            return;
        }
        let Some(session) = self.current.as_mut() else {
            return;
        };
        let node_id = event.node_id();
        if session.on_node_lost(node_id, clock::now_seconds()) {
            tracing::warn!(
                session_id = %session.id,
                node_id = %node_id,
                phase = ?session.phase,
                "node lost before confirming session transition"
            );
        }
        if session.phase == SessionPhase::Closed {
            self.archive_if_closed();
        }
    }
}

async fn run(mut requests: mpsc::Receiver<Request>, mut node_events: broadcast::Receiver<NodeEvent>) {
    let mut sessions = Sessions::default();
    let mut events_open = true;

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else { break };
                sessions.handle(request);
            }
            event = node_events.recv(), if events_open => match event {
                Ok(event) => sessions.on_node_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "session task lagged behind node events");
                }
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },
        }
    }
    tracing::debug!("session task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandKind, CommandResponse, ResponseStatus};
    use crate::session::state::{NodeRecordingState, SessionStatus};

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn acked(node: &str, kind: CommandKind) -> Outcome {
        Outcome::Acked(CommandResponse {
            seq: 1,
            kind,
            status: ResponseStatus::Success,
            node_id: node.to_string(),
            timestamp: clock::now_seconds(),
            message: String::new(),
            report: None,
        })
    }

    fn handle() -> (SessionHandle, broadcast::Sender<NodeEvent>) {
        let (events, rx) = broadcast::channel(16);
        (SessionHandle::spawn(rx), events)
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_open() {
        let (sessions, _events) = handle();
        sessions.begin("s1", &ids(&["a"]), vec![]).await.unwrap();
        let err = sessions.begin("s2", &ids(&["a"]), vec![]).await.unwrap_err();
        assert_eq!(err, SessionError::AlreadyRecording("s1".to_string()));
    }

    #[tokio::test]
    async fn stop_without_session_is_no_op() {
        let (sessions, _events) = handle();
        let plan = sessions.begin_stop(Some("ghost".to_string())).await.unwrap();
        assert_eq!(
            plan,
            StopPlan::NoOp {
                session_id: "ghost".to_string()
            }
        );
        assert!(sessions.archived().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_lifecycle_archives_session() {
        let (sessions, _events) = handle();
        sessions.begin("s1", &ids(&["a", "b"]), vec![]).await.unwrap();
        let started = sessions
            .start_resolved(
                "s1",
                vec![
                    ("a".to_string(), acked("a", CommandKind::Start), None),
                    ("b".to_string(), acked("b", CommandKind::Start), None),
                ],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.status(), SessionStatus::AllConfirmed);

        let StopPlan::Targets { session_id, targets } = sessions.begin_stop(None).await.unwrap() else {
            panic!("expected stop targets");
        };
        assert_eq!(targets, ids(&["a", "b"]));
        sessions
            .stop_resolved(
                &session_id,
                vec![
                    ("a".to_string(), acked("a", CommandKind::Stop), None),
                    ("b".to_string(), acked("b", CommandKind::Stop), None),
                ],
            )
            .await
            .unwrap();

        assert!(sessions.current().await.unwrap().is_none());
        let archived = sessions.archived().await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].phase, SessionPhase::Closed);
        assert!(sessions.get("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn node_loss_event_resolves_pending_record() {
        let (sessions, events) = handle();
        sessions.begin("s1", &ids(&["a", "b"]), vec![]).await.unwrap();
        sessions
            .start_resolved(
                "s1",
                vec![
                    ("a".to_string(), acked("a", CommandKind::Start), None),
                    ("b".to_string(), acked("b", CommandKind::Start), None),
                ],
            )
            .await
            .unwrap();

        events
            .send(NodeEvent::StateChanged {
                node_id: "b".to_string(),
                instance_id: uuid::Uuid::new_v4(),
                from: ConnectionState::Degraded,
                to: ConnectionState::Lost,
            })
            .unwrap();

        let mut state = None;
        for _ in 0..50 {
            let current = sessions.current().await.unwrap().unwrap();
            state = current.node_state("b");
            if state == Some(NodeRecordingState::UnconfirmedLost) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(state, Some(NodeRecordingState::UnconfirmedLost));
    }

    #[tokio::test]
    async fn marker_requires_open_session() {
        let (sessions, _events) = handle();
        let marker = SyncMarkerRecord {
            marker_id: "m1".to_string(),
            kind: crate::protocol::MarkerKind::Manual,
            description: String::new(),
            issued_at: 0.0,
            observations: std::collections::BTreeMap::new(),
            missing: std::collections::BTreeMap::new(),
        };
        assert_eq!(
            sessions.record_marker(marker).await,
            Err(SessionError::NoActiveSession)
        );
    }

    #[tokio::test]
    async fn shutdown_archives_open_session() {
        let (sessions, _events) = handle();
        sessions.begin("s1", &ids(&["a"]), vec![]).await.unwrap();
        let abandoned = sessions.shutdown().await.unwrap().unwrap();
        assert_eq!(
            abandoned.node_state("a"),
            Some(NodeRecordingState::UnconfirmedLost)
        );
        assert_eq!(sessions.archived().await.unwrap().len(), 1);
    }
}
