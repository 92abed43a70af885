//! Command dispatch with bounded waits and per-node outcomes
//!
//! `broadcast` fans out to every ACTIVE/DEGRADED node concurrently and
//! waits for each one independently; a slow node never delays the others.
//! START and STOP are sent exactly once. GET_STATUS and SYNC_TIME are
//! retried on timeout up to the configured limit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;

use crate::clock;
use crate::config::Config;
use crate::error::SendError;
use crate::nodes::ConnectionManager;
use crate::nodes::types::{ConnectionState, PendingFailure};
use crate::protocol::{Command, CommandKind, CommandParams, CommandResponse};

/// Result of one command to one node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The node answered (with any status)
    Acked(CommandResponse),
    /// No answer before the deadline, or the node was lost while waiting
    TimedOut,
    /// The node was not ACTIVE or DEGRADED
    NotConnected,
    /// The command could not be delivered or the controller shut down
    Failed { reason: String },
}

impl Outcome {
    #[must_use]
    pub const fn is_acked(&self) -> bool {
        matches!(self, Self::Acked(_))
    }

    /// Acked with a SUCCESS status
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Acked(r) if r.is_success())
    }

    #[must_use]
    pub const fn response(&self) -> Option<&CommandResponse> {
        match self {
            Self::Acked(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acked(r) => write!(f, "acked ({:?})", r.status),
            Self::TimedOut => f.write_str("timed out"),
            Self::NotConnected => f.write_str("not connected"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Aggregated per-node outcomes of one broadcast
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub kind: CommandKind,
    pub outcomes: BTreeMap<String, Outcome>,
    /// Targeted nodes with no valid clock offset at send time
    pub unsynchronized: BTreeSet<String>,
}

impl BroadcastReport {
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Nodes that acknowledged with SUCCESS
    #[must_use]
    pub fn succeeded(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_success())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    #[must_use]
    pub fn acked_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_acked()).count()
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&Outcome> {
        self.outcomes.get(node_id)
    }

    /// e.g. `2 of 3 nodes confirmed START`
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} of {} nodes confirmed {}",
            self.succeeded().len(),
            self.len(),
            self.kind
        )
    }
}

/// Deadlines and retry budget
#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub command_timeout: Duration,
    pub idempotent_retries: u32,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            idempotent_retries: 2,
        }
    }
}

impl From<&Config> for DispatchPolicy {
    fn from(config: &Config) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            idempotent_retries: config.idempotent_retries,
        }
    }
}

/// Issues commands through the connection manager
#[derive(Clone)]
pub struct Dispatcher {
    manager: ConnectionManager,
    policy: DispatchPolicy,
}

impl Dispatcher {
    #[must_use]
    pub const fn new(manager: ConnectionManager, policy: DispatchPolicy) -> Self {
        Self { manager, policy }
    }

    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    #[must_use]
    pub const fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Send to one node and wait up to `timeout` for its response
    ///
    /// Idempotent kinds are retried on timeout.
    pub async fn send_to_one(&self, node_id: &str, command: Command, timeout: Duration) -> Outcome {
        let kind = command.kind();
        let attempts = if kind.is_idempotent() {
            1 + self.policy.idempotent_retries
        } else {
            1
        };

        let mut outcome = Outcome::TimedOut;
        for attempt in 1..=attempts {
            outcome = self.attempt(node_id, command.clone(), timeout).await;
            if outcome != Outcome::TimedOut {
                break;
            }
            if attempt < attempts {
                tracing::debug!(node_id = %node_id, %kind, attempt, "retrying after timeout");
            }
        }
        outcome
    }

    async fn attempt(&self, node_id: &str, command: Command, timeout: Duration) -> Outcome {
        let kind = command.kind();
        let in_flight = match self.manager.send(node_id, command).await {
            Ok(in_flight) => in_flight,
            Err(SendError::NotConnected(_)) => return Outcome::NotConnected,
            Err(e @ SendError::WriteFailed(_)) => {
                return Outcome::Failed {
                    reason: e.to_string(),
                };
            }
        };
        let seq = in_flight.seq;

        match tokio::time::timeout(timeout, in_flight.reply).await {
            Ok(Ok(Ok(response))) => {
                if kind == CommandKind::SyncTime
                    && response.is_success()
                    && self.observe_clock(node_id, in_flight.sent_at, &response).await
                {
                    self.push_offset(node_id, timeout).await;
                }
                Outcome::Acked(response)
            }
            Ok(Ok(Err(PendingFailure::NodeLost)) | Err(_)) => {
                tracing::debug!(node_id = %node_id, seq, %kind, "node lost while command pending");
                Outcome::TimedOut
            }
            Ok(Ok(Err(PendingFailure::Shutdown))) => Outcome::Failed {
                reason: "controller shutting down".to_string(),
            },
            Err(_) => {
                self.manager
                    .release(node_id, in_flight.instance_id, seq)
                    .await;
                tracing::warn!(
                    node_id = %node_id,
                    seq,
                    %kind,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "command timed out"
                );
                Outcome::TimedOut
            }
        }
    }

    /// Feed one exchange to the estimator; true when the sample was accepted
    async fn observe_clock(&self, node_id: &str, t0: f64, response: &CommandResponse) -> bool {
        let t2 = clock::now_seconds();
        match self
            .manager
            .observe_clock(node_id, t0, response.timestamp, t2)
            .await
        {
            Some(Ok(sample)) => {
                tracing::debug!(
                    node_id = %node_id,
                    offset_ms = sample.offset * 1000.0,
                    latency_ms = sample.latency * 1000.0,
                    "clock sample accepted"
                );
                true
            }
            Some(Err(e)) => {
                tracing::debug!(node_id = %node_id, error = %e, "clock sample discarded");
                false
            }
            None => false,
        }
    }

    /// Hand a freshly accepted offset to the node at once
    ///
    /// The reply is not fed back to the estimator, so the node ends up holding
    /// exactly the controller's current estimate.
    async fn push_offset(&self, node_id: &str, timeout: Duration) {
        let Some(offset) = self.manager.offset(node_id).await else {
            return;
        };
        let command = Command::new(CommandParams::SyncTime {
            last_offset: Some(offset),
        });
        let in_flight = match self.manager.send(node_id, command).await {
            Ok(in_flight) => in_flight,
            Err(e) => {
                tracing::debug!(node_id = %node_id, error = %e, "offset not delivered");
                return;
            }
        };
        if !matches!(tokio::time::timeout(timeout, in_flight.reply).await, Ok(Ok(Ok(_)))) {
            self.manager
                .release(node_id, in_flight.instance_id, in_flight.seq)
                .await;
            tracing::debug!(node_id = %node_id, "offset delivery unconfirmed");
        }
    }

    /// Send to every ACTIVE/DEGRADED node; retained LOST nodes report `NotConnected`
    pub async fn broadcast(&self, command: Command, timeout: Duration) -> BroadcastReport {
        let targets = self.manager.broadcast_targets().await;
        self.fan_out(command, targets, timeout).await
    }

    /// Send to a chosen subset of nodes
    pub async fn broadcast_to(
        &self,
        node_ids: &[String],
        command: Command,
        timeout: Duration,
    ) -> BroadcastReport {
        let mut targets = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let state = self
                .manager
                .state(node_id)
                .await
                .unwrap_or(ConnectionState::Lost);
            targets.push((node_id.clone(), state));
        }
        self.fan_out(command, targets, timeout).await
    }

    async fn fan_out(
        &self,
        command: Command,
        targets: Vec<(String, ConnectionState)>,
        timeout: Duration,
    ) -> BroadcastReport {
        let kind = command.kind();
        let mut outcomes = BTreeMap::new();
        let mut unsynchronized = BTreeSet::new();
        let mut reachable = Vec::new();

        for (node_id, state) in targets {
            if state.is_reachable() {
                if self.manager.offset(&node_id).await.is_none() {
                    unsynchronized.insert(node_id.clone());
                }
                reachable.push(node_id);
            } else {
                outcomes.insert(node_id, Outcome::NotConnected);
            }
        }

        if !unsynchronized.is_empty() && kind == CommandKind::Start {
            tracing::warn!(nodes = ?unsynchronized, "starting nodes with unknown clock offset");
        }

        let sends = reachable.iter().map(|node_id| {
            let command = command.clone().to(node_id.clone());
            async move { (node_id.clone(), self.send_to_one(node_id, command, timeout).await) }
        });
        outcomes.extend(join_all(sends).await);

        let report = BroadcastReport {
            kind,
            outcomes,
            unsynchronized,
        };
        tracing::info!(%kind, summary = %report.summary(), "broadcast complete");
        report
    }

    /// Run a clock exchange with every reachable node
    pub async fn sync_clocks(&self) -> BroadcastReport {
        self.broadcast(
            Command::new(CommandParams::SyncTime { last_offset: None }),
            self.policy.command_timeout,
        )
        .await
    }

    /// Run a clock exchange with the listed nodes
    pub async fn sync_nodes(&self, node_ids: &[String]) -> BroadcastReport {
        self.broadcast_to(
            node_ids,
            Command::new(CommandParams::SyncTime { last_offset: None }),
            self.policy.command_timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::nodes::ConnectionSettings;
    use crate::protocol::{ControlMessage, Registration, ResponseStatus};

    async fn node(manager: &ConnectionManager, id: &str) -> mpsc::Receiver<ControlMessage> {
        let (tx, rx) = mpsc::channel(8);
        let link = manager
            .register(
                Registration {
                    node_id: id.to_string(),
                    ..Registration::default()
                },
                tx,
            )
            .await
            .unwrap();
        manager.activate(id, link.instance_id).await;
        rx
    }

    /// Answer every command on `rx` with SUCCESS, stamping `t1` with `skew` added
    fn responder(manager: ConnectionManager, mut rx: mpsc::Receiver<ControlMessage>, skew: f64) {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let ControlMessage::Command(command) = message {
                    let mut response =
                        CommandResponse::reply(&command, command.target.clone(), ResponseStatus::Success);
                    response.timestamp = clock::now_seconds() + skew;
                    manager.deliver_response(response).await;
                }
            }
        });
    }

    fn dispatcher(manager: &ConnectionManager, retries: u32) -> Dispatcher {
        Dispatcher::new(
            manager.clone(),
            DispatchPolicy {
                command_timeout: Duration::from_millis(200),
                idempotent_retries: retries,
            },
        )
    }

    #[tokio::test]
    async fn acked_when_node_answers() {
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let rx = node(&manager, "a").await;
        responder(manager.clone(), rx, 0.0);

        let outcome = dispatcher(&manager, 0)
            .send_to_one("a", Command::new(CommandParams::GetStatus), Duration::from_secs(1))
            .await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn unknown_node_is_not_connected() {
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let outcome = dispatcher(&manager, 2)
            .send_to_one("ghost", Command::new(CommandParams::Stop), Duration::from_millis(50))
            .await;
        assert_eq!(outcome, Outcome::NotConnected);
    }

    #[tokio::test]
    async fn start_is_sent_once_on_timeout() {
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let mut rx = node(&manager, "a").await;

        let outcome = dispatcher(&manager, 2)
            .send_to_one(
                "a",
                Command::new(CommandParams::Start { modalities: vec![] }),
                Duration::from_millis(30),
            )
            .await;
        assert_eq!(outcome, Outcome::TimedOut);

        assert!(matches!(rx.try_recv(), Ok(ControlMessage::Command(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.get("a").await.unwrap().pending_commands, 0);
    }

    #[tokio::test]
    async fn status_is_retried_up_to_limit() {
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let mut rx = node(&manager, "a").await;

        let outcome = dispatcher(&manager, 2)
            .send_to_one("a", Command::new(CommandParams::GetStatus), Duration::from_millis(20))
            .await;
        assert_eq!(outcome, Outcome::TimedOut);

        let mut seqs = Vec::new();
        while let Ok(ControlMessage::Command(c)) = rx.try_recv() {
            seqs.push(c.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sync_time_ack_updates_offset() {
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let rx = node(&manager, "a").await;
        responder(manager.clone(), rx, 2.0);

        let report = dispatcher(&manager, 0).sync_clocks().await;
        assert!(report.get("a").unwrap().is_success());
        assert!(report.unsynchronized.contains("a"));

        let offset = manager.offset("a").await.unwrap();
        assert!((offset - 2.0).abs() < 0.1, "offset {offset}");
    }

    #[tokio::test]
    async fn accepted_offset_is_pushed_to_node() {
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let mut rx = node(&manager, "a").await;
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let answering = manager.clone();
        tokio::spawn(async move {
            while let Some(ControlMessage::Command(command)) = rx.recv().await {
                let _ = seen_tx.send(command.params.clone());
                let mut response = CommandResponse::reply(&command, "a", ResponseStatus::Success);
                response.timestamp = clock::now_seconds() + 2.0;
                answering.deliver_response(response).await;
            }
        });

        dispatcher(&manager, 0).sync_clocks().await;
        let offset = manager.offset("a").await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), CommandParams::SyncTime { last_offset: None });
        assert_eq!(
            seen.recv().await.unwrap(),
            CommandParams::SyncTime {
                last_offset: Some(offset)
            }
        );
        assert_eq!(manager.get("a").await.unwrap().pending_commands, 0);
    }

    #[tokio::test]
    async fn broadcast_reports_every_target() {
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let rx_a = node(&manager, "a").await;
        let _silent = node(&manager, "b").await;
        responder(manager.clone(), rx_a, 0.0);

        let report = dispatcher(&manager, 0)
            .broadcast(Command::new(CommandParams::Stop), Duration::from_millis(50))
            .await;
        assert_eq!(report.len(), 2);
        assert!(report.get("a").unwrap().is_success());
        assert_eq!(report.get("b"), Some(&Outcome::TimedOut));
        assert_eq!(report.summary(), "1 of 2 nodes confirmed STOP");
    }

    #[tokio::test]
    async fn shutdown_flushes_failed_outcomes() {
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let _rx = node(&manager, "a").await;
        let dispatcher = dispatcher(&manager, 0);

        let pending = tokio::spawn(async move {
            dispatcher
                .send_to_one("a", Command::new(CommandParams::Stop), Duration::from_secs(30))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.shutdown().await;

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));
    }
}
