//! Recording session state machine
//!
//! Per node within a session:
//!
//! ```text
//! REQUESTED → CONFIRMED → STOPPING → STOPPED
//!      └──────────┴───────────┴──→ UNCONFIRMED_LOST
//! ```
//!
//! The global status is derived from the per-node records, never stored.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::dispatcher::Outcome;
use crate::markers::SyncMarkerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRecordingState {
    Requested,
    Confirmed,
    Stopping,
    Stopped,
    /// The node was lost before confirming its pending transition
    UnconfirmedLost,
}

impl NodeRecordingState {
    /// No further transitions happen from here
    #[must_use]
    pub const fn is_resolved(self) -> bool {
        matches!(self, Self::Stopped | Self::UnconfirmedLost)
    }
}

/// Derived fleet-wide start status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// START acknowledgments are still being collected
    Pending,
    AllConfirmed,
    Partial,
    FailedToStart,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::AllConfirmed => "ALL_CONFIRMED",
            Self::Partial => "PARTIAL",
            Self::FailedToStart => "FAILED_TO_START",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Starting,
    Recording,
    Stopping,
    Closed,
}

/// A node's acknowledgment time
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Confirmation {
    /// Node-local clock
    pub local: f64,
    /// Controller clock, if the node's offset was known
    pub corrected: Option<f64>,
}

impl Confirmation {
    #[must_use]
    pub fn new(local: f64, offset: Option<f64>) -> Self {
        Self {
            local,
            corrected: offset.map(|o| local - o),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub state: NodeRecordingState,
    pub start_confirmed: Option<Confirmation>,
    pub stop_confirmed: Option<Confirmation>,
    /// Last non-success outcome, for operator display
    pub note: Option<String>,
}

impl NodeRecord {
    const fn requested() -> Self {
        Self {
            state: NodeRecordingState::Requested,
            start_confirmed: None,
            stop_confirmed: None,
            note: None,
        }
    }
}

/// One capture session across the fleet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub modalities: Vec<String>,
    pub phase: SessionPhase,
    /// Controller clock when START was issued
    pub start_requested_at: f64,
    pub stop_requested_at: Option<f64>,
    pub closed_at: Option<f64>,
    pub nodes: BTreeMap<String, NodeRecord>,
    pub markers: Vec<SyncMarkerRecord>,
    #[serde(skip)]
    start_window_closed: bool,
}

impl Session {
    /// Open a session with every target in REQUESTED
    #[must_use]
    pub fn begin(id: impl Into<String>, targets: &[String], modalities: Vec<String>, now: f64) -> Self {
        Self {
            id: id.into(),
            modalities,
            phase: SessionPhase::Starting,
            start_requested_at: now,
            stop_requested_at: None,
            closed_at: None,
            nodes: targets
                .iter()
                .map(|id| (id.clone(), NodeRecord::requested()))
                .collect(),
            markers: Vec::new(),
            start_window_closed: false,
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.phase != SessionPhase::Closed
    }

    #[must_use]
    pub fn node_state(&self, node_id: &str) -> Option<NodeRecordingState> {
        self.nodes.get(node_id).map(|r| r.state)
    }

    /// Nodes that acknowledged START at any point
    #[must_use]
    pub fn confirmed_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|r| r.start_confirmed.is_some())
            .count()
    }

    /// Global status derived from per-node records
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let confirmed = self.confirmed_count();
        if confirmed > 0 && confirmed == self.nodes.len() {
            SessionStatus::AllConfirmed
        } else if confirmed > 0 {
            SessionStatus::Partial
        } else if self.start_window_closed {
            SessionStatus::FailedToStart
        } else {
            SessionStatus::Pending
        }
    }

    /// Fold one node's START outcome into the session
    pub fn apply_start_outcome(&mut self, node_id: &str, outcome: &Outcome, offset: Option<f64>) {
        let Some(record) = self.nodes.get_mut(node_id) else {
            return;
        };
        if record.state != NodeRecordingState::Requested {
            return;
        }

        match outcome {
            Outcome::Acked(response) if response.is_success() => {
                record.state = NodeRecordingState::Confirmed;
                record.start_confirmed = Some(Confirmation::new(response.timestamp, offset));
            }
            Outcome::NotConnected => {
                record.state = NodeRecordingState::UnconfirmedLost;
                record.note = Some(outcome.to_string());
            }
            other => record.note = Some(other.to_string()),
        }
    }

    /// Close the START window; a session nobody confirmed closes immediately
    pub fn finish_start(&mut self, now: f64) {
        self.start_window_closed = true;
        if self.phase != SessionPhase::Starting {
            return;
        }
        if self.confirmed_count() == 0 {
            self.phase = SessionPhase::Closed;
            self.closed_at = Some(now);
        } else {
            self.phase = SessionPhase::Recording;
        }
    }

    /// Enter STOPPING and return the nodes to send STOP to
    ///
    /// Calling again while stopping re-targets nodes that have not confirmed.
    pub fn begin_stop(&mut self, now: f64) -> Vec<String> {
        if !self.is_open() {
            return Vec::new();
        }
        self.phase = SessionPhase::Stopping;
        self.stop_requested_at.get_or_insert(now);

        let mut targets = Vec::new();
        for (node_id, record) in &mut self.nodes {
            if matches!(
                record.state,
                NodeRecordingState::Requested
                    | NodeRecordingState::Confirmed
                    | NodeRecordingState::Stopping
            ) {
                record.state = NodeRecordingState::Stopping;
                targets.push(node_id.clone());
            }
        }
        targets
    }

    /// Fold one node's STOP outcome into the session
    pub fn apply_stop_outcome(&mut self, node_id: &str, outcome: &Outcome, offset: Option<f64>) {
        let Some(record) = self.nodes.get_mut(node_id) else {
            return;
        };
        if record.state != NodeRecordingState::Stopping {
            return;
        }

        match outcome {
            Outcome::Acked(response) if response.is_success() => {
                record.state = NodeRecordingState::Stopped;
                record.stop_confirmed = Some(Confirmation::new(response.timestamp, offset));
            }
            Outcome::NotConnected => {
                record.state = NodeRecordingState::UnconfirmedLost;
                record.note = Some(outcome.to_string());
            }
            other => record.note = Some(other.to_string()),
        }
    }

    /// Close a stopping session once every node is resolved
    pub fn try_close(&mut self, now: f64) -> bool {
        if self.phase == SessionPhase::Stopping && self.nodes.values().all(|r| r.state.is_resolved()) {
            self.phase = SessionPhase::Closed;
            self.closed_at = Some(now);
            return true;
        }
        false
    }

    /// A node went LOST; unresolved records become UNCONFIRMED_LOST
    pub fn on_node_lost(&mut self, node_id: &str, now: f64) -> bool {
        if !self.is_open() {
            return false;
        }
        let Some(record) = self.nodes.get_mut(node_id) else {
            return false;
        };
        if record.state.is_resolved() {
            return false;
        }

        record.state = NodeRecordingState::UnconfirmedLost;
        self.try_close(now);
        true
    }

    /// Archive an open session during controller shutdown
    pub fn abandon(&mut self, now: f64) {
        for record in self.nodes.values_mut() {
            if !record.state.is_resolved() {
                record.state = NodeRecordingState::UnconfirmedLost;
                record.note = Some("controller shut down".to_string());
            }
        }
        self.start_window_closed = true;
        self.phase = SessionPhase::Closed;
        self.closed_at.get_or_insert(now);
    }

    pub fn record_marker(&mut self, marker: SyncMarkerRecord) {
        self.markers.push(marker);
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary::from(self)
    }
}

/// Compact view of a session for operator display
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub phase: SessionPhase,
    pub status: SessionStatus,
    pub targeted: usize,
    pub confirmed: usize,
    pub stopped: usize,
    pub unconfirmed_lost: usize,
    pub markers: usize,
}

impl SessionSummary {
    /// STOP issued for a session that never started
    #[must_use]
    pub fn no_op_stop(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            phase: SessionPhase::Stopping,
            status: SessionStatus::FailedToStart,
            targeted: 0,
            confirmed: 0,
            stopped: 0,
            unconfirmed_lost: 0,
            markers: 0,
        }
    }
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        let count = |state: NodeRecordingState| session.nodes.values().filter(|r| r.state == state).count();
        Self {
            session_id: session.id.clone(),
            phase: session.phase,
            status: session.status(),
            targeted: session.nodes.len(),
            confirmed: session.confirmed_count(),
            stopped: count(NodeRecordingState::Stopped),
            unconfirmed_lost: count(NodeRecordingState::UnconfirmedLost),
            markers: session.markers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandKind, CommandResponse, ResponseStatus};

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn acked(node: &str, kind: CommandKind, at: f64) -> Outcome {
        Outcome::Acked(CommandResponse {
            seq: 1,
            kind,
            status: ResponseStatus::Success,
            node_id: node.to_string(),
            timestamp: at,
            message: String::new(),
            report: None,
        })
    }

    #[test]
    fn partial_start_when_one_node_missing() {
        let mut session = Session::begin("s1", &ids(&["a", "b", "c"]), vec![], 10.0);
        assert_eq!(session.status(), SessionStatus::Pending);

        session.apply_start_outcome("a", &acked("a", CommandKind::Start, 10.1), Some(0.0));
        session.apply_start_outcome("b", &Outcome::NotConnected, None);
        session.apply_start_outcome("c", &acked("c", CommandKind::Start, 12.2), Some(2.0));
        session.finish_start(10.5);

        assert_eq!(session.status(), SessionStatus::Partial);
        assert_eq!(session.phase, SessionPhase::Recording);
        assert_eq!(session.node_state("b"), Some(NodeRecordingState::UnconfirmedLost));

        let c = session.nodes["c"].start_confirmed.unwrap();
        assert!((c.corrected.unwrap() - 10.2).abs() < 1e-9);
    }

    #[test]
    fn all_confirmed() {
        let mut session = Session::begin("s1", &ids(&["a", "b"]), vec![], 0.0);
        session.apply_start_outcome("a", &acked("a", CommandKind::Start, 0.1), None);
        session.apply_start_outcome("b", &acked("b", CommandKind::Start, 0.1), None);
        session.finish_start(1.0);
        assert_eq!(session.status(), SessionStatus::AllConfirmed);
        assert_eq!(session.nodes["a"].start_confirmed.unwrap().corrected, None);
    }

    #[test]
    fn nobody_confirming_fails_and_closes() {
        let mut session = Session::begin("s1", &ids(&["a"]), vec![], 0.0);
        session.apply_start_outcome("a", &Outcome::TimedOut, None);
        session.finish_start(2.0);
        assert_eq!(session.status(), SessionStatus::FailedToStart);
        assert!(!session.is_open());
        assert_eq!(session.nodes["a"].note.as_deref(), Some("timed out"));
    }

    #[test]
    fn stop_closes_when_all_resolved() {
        let mut session = Session::begin("s1", &ids(&["a", "b"]), vec![], 0.0);
        session.apply_start_outcome("a", &acked("a", CommandKind::Start, 0.1), None);
        session.apply_start_outcome("b", &acked("b", CommandKind::Start, 0.1), None);
        session.finish_start(1.0);

        let targets = session.begin_stop(5.0);
        assert_eq!(targets, ids(&["a", "b"]));
        session.apply_stop_outcome("a", &acked("a", CommandKind::Stop, 5.1), None);
        session.apply_stop_outcome("b", &Outcome::TimedOut, None);
        assert!(!session.try_close(6.0));
        assert_eq!(session.phase, SessionPhase::Stopping);

        // b drops off: its stop can no longer be confirmed
        assert!(session.on_node_lost("b", 7.0));
        assert_eq!(session.phase, SessionPhase::Closed);
        assert_eq!(session.closed_at, Some(7.0));
        assert_eq!(session.summary().stopped, 1);
        assert_eq!(session.summary().unconfirmed_lost, 1);
    }

    #[test]
    fn repeated_stop_retargets_unconfirmed_nodes() {
        let mut session = Session::begin("s1", &ids(&["a", "b"]), vec![], 0.0);
        session.apply_start_outcome("a", &acked("a", CommandKind::Start, 0.1), None);
        session.apply_start_outcome("b", &acked("b", CommandKind::Start, 0.1), None);
        session.finish_start(1.0);
        session.begin_stop(2.0);
        session.apply_stop_outcome("a", &acked("a", CommandKind::Stop, 2.1), None);

        assert_eq!(session.begin_stop(3.0), ids(&["b"]));
        assert_eq!(session.stop_requested_at, Some(2.0));
    }

    #[test]
    fn lost_before_confirming_start_is_unconfirmed() {
        let mut session = Session::begin("s1", &ids(&["a"]), vec![], 0.0);
        assert!(session.on_node_lost("a", 0.5));
        assert_eq!(session.node_state("a"), Some(NodeRecordingState::UnconfirmedLost));
        // a late ack does not resurrect the record
        session.apply_start_outcome("a", &acked("a", CommandKind::Start, 0.6), None);
        assert_eq!(session.node_state("a"), Some(NodeRecordingState::UnconfirmedLost));
    }

    #[test]
    fn abandon_marks_open_nodes_lost() {
        let mut session = Session::begin("s1", &ids(&["a", "b"]), vec![], 0.0);
        session.apply_start_outcome("a", &acked("a", CommandKind::Start, 0.1), None);
        session.finish_start(1.0);
        session.abandon(9.0);

        assert!(!session.is_open());
        assert!(session
            .nodes
            .values()
            .all(|r| r.state == NodeRecordingState::UnconfirmedLost));
    }

    #[test]
    fn no_op_stop_has_zero_confirmed() {
        let summary = SessionSummary::no_op_stop("never-started");
        assert_eq!(summary.phase, SessionPhase::Stopping);
        assert_eq!(summary.confirmed, 0);
    }
}
