//! Sync markers for post-hoc skew auditing
//!
//! A marker is broadcast to every node with the controller's send time.
//! Each node logs its own local observation into its data stream and echoes
//! the local time in its acknowledgment. Markers never adjust clock offsets.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::clock;
use crate::dispatcher::Dispatcher;
use crate::error::SessionError;
use crate::protocol::{Command, CommandParams, MarkerKind};
use crate::session::SessionHandle;

/// One node's view of a marker
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarkerObservation {
    /// Node-local clock
    pub local: f64,
    /// Controller clock via the node's offset at emission time
    pub corrected: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMarkerRecord {
    pub marker_id: String,
    pub kind: MarkerKind,
    pub description: String,
    /// Controller clock when the marker was issued
    pub issued_at: f64,
    pub observations: BTreeMap<String, MarkerObservation>,
    /// Nodes that did not acknowledge, with their outcome
    pub missing: BTreeMap<String, String>,
}

impl SyncMarkerRecord {
    /// Spread of corrected observation times across nodes, seconds
    ///
    /// `None` with fewer than two corrected observations.
    #[must_use]
    pub fn realized_skew(&self) -> Option<f64> {
        let corrected: Vec<f64> = self
            .observations
            .values()
            .filter_map(|o| o.corrected)
            .collect();
        if corrected.len() < 2 {
            return None;
        }
        let min = corrected.iter().copied().fold(f64::INFINITY, f64::min);
        let max = corrected.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(max - min)
    }
}

/// Issues markers to the fleet and records them on the open session
#[derive(Clone)]
pub struct MarkerEmitter {
    dispatcher: Dispatcher,
    sessions: SessionHandle,
    timeout: Duration,
}

impl MarkerEmitter {
    #[must_use]
    pub const fn new(dispatcher: Dispatcher, sessions: SessionHandle, timeout: Duration) -> Self {
        Self {
            dispatcher,
            sessions,
            timeout,
        }
    }

    /// Emit a marker to every connected node
    ///
    /// # Errors
    ///
    /// Returns `NoActiveSession` when no session is open
    pub async fn emit(
        &self,
        kind: MarkerKind,
        description: impl Into<String>,
    ) -> Result<SyncMarkerRecord, SessionError> {
        let session = self
            .sessions
            .current()
            .await?
            .ok_or(SessionError::NoActiveSession)?;
        let description = description.into();
        let marker_id = format!("marker_{}", Uuid::new_v4().simple());

        let command = Command::new(CommandParams::MarkEvent {
            marker_id: marker_id.clone(),
            marker_kind: kind,
            description: description.clone(),
        })
        .with_session(session.id.clone());
        let issued_at = clock::now_seconds();

        let report = self.dispatcher.broadcast(command, self.timeout).await;

        let mut observations = BTreeMap::new();
        let mut missing = BTreeMap::new();
        for (node_id, outcome) in &report.outcomes {
            match outcome.response().filter(|r| r.is_success()) {
                Some(response) => {
                    let offset = self.dispatcher.manager().offset(node_id).await;
                    observations.insert(
                        node_id.clone(),
                        MarkerObservation {
                            local: response.timestamp,
                            corrected: offset.map(|o| response.timestamp - o),
                        },
                    );
                }
                None => {
                    missing.insert(node_id.clone(), outcome.to_string());
                }
            }
        }

        let record = SyncMarkerRecord {
            marker_id,
            kind,
            description,
            issued_at,
            observations,
            missing,
        };

        if let Some(skew) = record.realized_skew() {
            tracing::info!(
                marker_id = %record.marker_id,
                kind = %kind,
                skew_ms = skew * 1000.0,
                "sync marker recorded"
            );
        } else {
            tracing::info!(marker_id = %record.marker_id, kind = %kind, "sync marker recorded");
        }

        self.sessions.record_marker(record.clone()).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(observations: &[(&str, f64, Option<f64>)]) -> SyncMarkerRecord {
        SyncMarkerRecord {
            marker_id: "m".to_string(),
            kind: MarkerKind::Manual,
            description: String::new(),
            issued_at: 0.0,
            observations: observations
                .iter()
                .map(|(id, local, corrected)| {
                    (
                        (*id).to_string(),
                        MarkerObservation {
                            local: *local,
                            corrected: *corrected,
                        },
                    )
                })
                .collect(),
            missing: BTreeMap::new(),
        }
    }

    #[test]
    fn skew_is_spread_of_corrected_times() {
        let marker = record(&[
            ("a", 100.0, Some(100.010)),
            ("b", 98.0, Some(100.040)),
            ("c", 103.0, Some(100.025)),
        ]);
        assert!((marker.realized_skew().unwrap() - 0.030).abs() < 1e-9);
    }

    #[test]
    fn skew_needs_two_corrected_observations() {
        assert_eq!(record(&[("a", 1.0, Some(1.0)), ("b", 2.0, None)]).realized_skew(), None);
    }
}
