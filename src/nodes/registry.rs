//! Node registry: the single owner of connection state

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use super::types::{
    CaptureNode, ConnectionState, LivenessReport, NodeEvent, NodeLink, NodeSnapshot,
    PendingCommand, PendingFailure, PreparedCommand,
};
use crate::clock::{self, ClockOffsetEstimator, ClockSample, ClockSyncError, SyncQuality};
use crate::error::{RegisterError, SendError};
use crate::protocol::{Command, CommandParams, CommandResponse, ControlMessage, Registration};

/// Shared registry handle
pub type SharedNodeRegistry = Arc<Mutex<NodeRegistry>>;

const EVENT_CAPACITY: usize = 256;

/// Registry of capture nodes
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: HashMap<String, CaptureNode>,
    events: broadcast::Sender<NodeEvent>,
    latency_ceiling: Duration,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(clock::DEFAULT_LATENCY_CEILING)
    }
}

impl NodeRegistry {
    /// Create an empty registry whose clock estimators use `latency_ceiling`
    #[must_use]
    pub fn new(latency_ceiling: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            nodes: HashMap::new(),
            events,
            latency_ceiling,
        }
    }

    /// Subscribe to state-change events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: NodeEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn transition(events: &broadcast::Sender<NodeEvent>, node: &mut CaptureNode, to: ConnectionState) {
        let from = node.state;
        if from == to {
            return;
        }
        node.state = to;
        tracing::debug!(node_id = %node.node_id, %from, %to, "node state changed");
        let _ = events.send(NodeEvent::StateChanged {
            node_id: node.node_id.clone(),
            instance_id: node.instance_id,
            from,
            to,
        });
    }

    /// Accept a handshake and create a fresh node record in `REGISTERED`
    ///
    /// A LOST record with the same id is replaced by a new instance.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for an empty id and `DuplicateId` if a live node
    /// already holds the id
    pub fn register(
        &mut self,
        registration: Registration,
        outbound: mpsc::Sender<ControlMessage>,
    ) -> Result<NodeLink, RegisterError> {
        let node_id = registration.node_id.trim().to_string();
        if node_id.is_empty() {
            return Err(RegisterError::Malformed("empty device id".to_string()));
        }

        if let Some(existing) = self.nodes.get(&node_id) {
            if existing.state != ConnectionState::Lost {
                return Err(RegisterError::DuplicateId(node_id));
            }
            let old_instance = existing.instance_id;
            self.nodes.remove(&node_id);
            self.emit(NodeEvent::Removed {
                node_id: node_id.clone(),
                instance_id: old_instance,
            });
            tracing::info!(node_id = %node_id, "replacing lost node record");
        }

        let (close, closed) = watch::channel(false);
        let instance_id = Uuid::new_v4();
        let mut node = CaptureNode {
            node_id: node_id.clone(),
            instance_id,
            display_name: registration.display_name,
            platform: registration.platform,
            capabilities: registration.capabilities,
            address: None,
            state: ConnectionState::Connecting,
            connected_at: chrono::Utc::now(),
            last_seen: Instant::now(),
            clock: ClockOffsetEstimator::new(self.latency_ceiling),
            next_seq: 1,
            pending: HashMap::new(),
            outbound: Some(outbound),
            close,
            lost_ticks: 0,
        };
        Self::transition(&self.events, &mut node, ConnectionState::Registered);
        self.nodes.insert(node_id.clone(), node);

        tracing::info!(node_id = %node_id, %instance_id, "node registered");
        Ok(NodeLink {
            node_id,
            instance_id,
            closed,
        })
    }

    fn instance_mut(&mut self, node_id: &str, instance_id: Uuid) -> Option<&mut CaptureNode> {
        self.nodes
            .get_mut(node_id)
            .filter(|n| n.instance_id == instance_id)
    }

    /// Move a freshly registered node to `ACTIVE`
    pub fn activate(&mut self, node_id: &str, instance_id: Uuid) -> bool {
        let events = self.events.clone();
        match self.instance_mut(node_id, instance_id) {
            Some(node) if node.state == ConnectionState::Registered => {
                node.last_seen = Instant::now();
                Self::transition(&events, node, ConnectionState::Active);
                true
            }
            _ => false,
        }
    }

    /// Tie a connection instance to the address its control channel came from
    pub fn bind_address(&mut self, node_id: &str, instance_id: Uuid, address: IpAddr) -> bool {
        self.instance_mut(node_id, instance_id).is_some_and(|node| {
            node.address = Some(address.to_canonical());
            true
        })
    }

    /// Instance allowed to send datagrams as `node_id` from `source`
    ///
    /// Only reachable nodes with a bound address qualify.
    #[must_use]
    pub fn datagram_instance(&self, node_id: &str, source: IpAddr) -> Option<Uuid> {
        self.nodes
            .get(node_id)
            .filter(|n| n.state.is_reachable() && n.address == Some(source.to_canonical()))
            .map(|n| n.instance_id)
    }

    /// Note inbound traffic; a DEGRADED node returns to ACTIVE
    pub fn record_traffic(&mut self, node_id: &str, instance_id: Uuid) {
        let events = self.events.clone();
        if let Some(node) = self.instance_mut(node_id, instance_id) {
            if node.state == ConnectionState::Lost {
                return;
            }
            node.last_seen = Instant::now();
            if node.state == ConnectionState::Degraded {
                Self::transition(&events, node, ConnectionState::Active);
            }
        }
    }

    fn lose(events: &broadcast::Sender<NodeEvent>, node: &mut CaptureNode, failure: PendingFailure) {
        for (seq, pending) in node.pending.drain() {
            tracing::debug!(node_id = %node.node_id, seq, kind = %pending.kind, "failing pending command");
            let _ = pending.reply.send(Err(failure));
        }
        node.outbound = None;
        let _ = node.close.send(true);
        node.lost_ticks = 0;
        Self::transition(events, node, ConnectionState::Lost);
    }

    /// Transition a connection instance to `LOST`, failing its pending commands
    ///
    /// Returns false if the instance is unknown or already lost.
    pub fn mark_lost(&mut self, node_id: &str, instance_id: Uuid, reason: &str) -> bool {
        let events = self.events.clone();
        match self.instance_mut(node_id, instance_id) {
            Some(node) if node.state != ConnectionState::Lost => {
                tracing::warn!(node_id = %node_id, reason, "node lost");
                Self::lose(&events, node, PendingFailure::NodeLost);
                true
            }
            _ => false,
        }
    }

    /// Remove a node outright
    pub fn unregister(&mut self, node_id: &str) -> Option<NodeSnapshot> {
        let mut node = self.nodes.remove(node_id)?;
        if node.state != ConnectionState::Lost {
            Self::lose(&self.events, &mut node, PendingFailure::NodeLost);
        }
        self.emit(NodeEvent::Removed {
            node_id: node.node_id.clone(),
            instance_id: node.instance_id,
        });
        tracing::info!(node_id = %node_id, "node unregistered");
        Some(NodeSnapshot::from(&node))
    }

    /// Run one liveness check at `now`
    ///
    /// A node silent for `interval` is probed and becomes DEGRADED; silent for
    /// twice the interval it becomes LOST. LOST records are pruned after
    /// `retention` further ticks.
    pub fn liveness_tick(
        &mut self,
        now: Instant,
        interval: Duration,
        retention: u32,
    ) -> LivenessReport {
        let mut report = LivenessReport::default();
        let timeout = interval * 2;

        for node in self.nodes.values_mut() {
            let silent = now.saturating_duration_since(node.last_seen);
            match node.state {
                ConnectionState::Lost => {
                    node.lost_ticks += 1;
                    if node.lost_ticks >= retention {
                        report.pruned.push(node.node_id.clone());
                    }
                }
                ConnectionState::Registered | ConnectionState::Active if silent >= interval => {
                    Self::transition(&self.events, node, ConnectionState::Degraded);
                    report.degraded.push(node.node_id.clone());
                    if silent >= timeout {
                        tracing::warn!(node_id = %node.node_id, silent_secs = silent.as_secs(), "liveness timeout");
                        Self::lose(&self.events, node, PendingFailure::NodeLost);
                        report.lost.push(node.node_id.clone());
                    } else {
                        Self::probe(node);
                    }
                }
                ConnectionState::Degraded if silent >= timeout => {
                    tracing::warn!(node_id = %node.node_id, silent_secs = silent.as_secs(), "liveness timeout");
                    Self::lose(&self.events, node, PendingFailure::NodeLost);
                    report.lost.push(node.node_id.clone());
                }
                _ => {}
            }
        }

        for node_id in &report.pruned {
            if let Some(node) = self.nodes.remove(node_id) {
                tracing::debug!(node_id = %node_id, "pruning lost node");
                self.emit(NodeEvent::Removed {
                    node_id: node.node_id,
                    instance_id: node.instance_id,
                });
            }
        }

        report
    }

    fn probe(node: &CaptureNode) {
        let Some(outbound) = &node.outbound else {
            return;
        };
        let probe = ControlMessage::Heartbeat {
            device_id: node.node_id.clone(),
            timestamp: clock::now_seconds(),
        };
        if let Err(e) = outbound.try_send(probe) {
            tracing::debug!(node_id = %node.node_id, error = %e, "liveness probe not queued");
        }
    }

    /// Allocate a sequence number and pending slot for `command`
    ///
    /// `SYNC_TIME` commands without a `last_offset` get the node's current
    /// estimate filled in.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless the node is ACTIVE or DEGRADED
    pub fn prepare_command(
        &mut self,
        node_id: &str,
        mut command: Command,
    ) -> Result<PreparedCommand, SendError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .filter(|n| n.state.is_reachable())
            .ok_or_else(|| SendError::NotConnected(node_id.to_string()))?;
        let outbound = node
            .outbound
            .clone()
            .ok_or_else(|| SendError::NotConnected(node_id.to_string()))?;

        let seq = node.next_seq;
        node.next_seq += 1;

        command.seq = seq;
        command.target = node_id.to_string();
        if let CommandParams::SyncTime { last_offset } = &mut command.params {
            if last_offset.is_none() {
                *last_offset = node.clock.offset();
            }
        }

        let (tx, rx) = oneshot::channel();
        node.pending.insert(
            seq,
            PendingCommand {
                kind: command.kind(),
                sent_at: Instant::now(),
                reply: tx,
            },
        );

        Ok(PreparedCommand {
            instance_id: node.instance_id,
            command,
            reply: rx,
            outbound,
        })
    }

    /// Release an outstanding slot (timeout or failed write)
    ///
    /// A response bearing this sequence number will no longer match.
    pub fn release(&mut self, node_id: &str, instance_id: Uuid, seq: u64) -> bool {
        self.instance_mut(node_id, instance_id)
            .and_then(|n| n.pending.remove(&seq))
            .is_some()
    }

    /// Match a response against its pending command
    ///
    /// Returns false (and discards the response) if nothing is waiting for it.
    pub fn resolve(&mut self, response: CommandResponse) -> bool {
        let Some(node) = self.nodes.get_mut(&response.node_id) else {
            tracing::debug!(node_id = %response.node_id, seq = response.seq, "response from unknown node discarded");
            return false;
        };

        match node.pending.get(&response.seq) {
            Some(pending) if pending.kind == response.kind => {}
            Some(pending) => {
                tracing::warn!(
                    node_id = %response.node_id,
                    seq = response.seq,
                    expected = %pending.kind,
                    got = %response.kind,
                    "response kind mismatch, discarded"
                );
                return false;
            }
            None => {
                tracing::warn!(
                    node_id = %response.node_id,
                    seq = response.seq,
                    kind = %response.kind,
                    "no pending command for response, discarded"
                );
                return false;
            }
        }

        let Some(pending) = node.pending.remove(&response.seq) else {
            return false;
        };
        tracing::trace!(
            node_id = %response.node_id,
            seq = response.seq,
            elapsed_ms = pending.sent_at.elapsed().as_secs_f64() * 1000.0,
            "response matched"
        );
        pending.reply.send(Ok(response)).is_ok()
    }

    /// Feed a clock exchange to the node's estimator
    pub fn observe_clock(
        &mut self,
        node_id: &str,
        t0: f64,
        t1: f64,
        t2: f64,
    ) -> Option<Result<ClockSample, ClockSyncError>> {
        let node = self.nodes.get_mut(node_id)?;
        Some(node.clock.observe(t0, t1, t2))
    }

    /// Current offset estimate, `None` if unknown
    #[must_use]
    pub fn offset(&self, node_id: &str) -> Option<f64> {
        self.nodes.get(node_id).and_then(|n| n.clock.offset())
    }

    #[must_use]
    pub fn sync_quality(&self, node_id: &str) -> Option<SyncQuality> {
        self.nodes.get(node_id).map(|n| n.clock.quality())
    }

    /// Nodes whose clock has never been synchronized or is due a resync
    #[must_use]
    pub fn resync_due(&self, now: Instant, interval: Duration) -> Vec<String> {
        let mut due: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.state.is_reachable() && n.clock.is_resync_due(now, interval))
            .map(|n| n.node_id.clone())
            .collect();
        due.sort();
        due
    }

    /// Broadcast fan-out set: reachable nodes plus retained LOST records
    #[must_use]
    pub fn broadcast_targets(&self) -> Vec<(String, ConnectionState)> {
        let mut targets: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.state.is_reachable() || n.state == ConnectionState::Lost)
            .map(|n| (n.node_id.clone(), n.state))
            .collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        targets
    }

    #[must_use]
    pub fn state(&self, node_id: &str) -> Option<ConnectionState> {
        self.nodes.get(node_id).map(|n| n.state)
    }

    #[must_use]
    pub fn instance(&self, node_id: &str) -> Option<Uuid> {
        self.nodes.get(node_id).map(|n| n.instance_id)
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<NodeSnapshot> {
        self.nodes.get(node_id).map(NodeSnapshot::from)
    }

    /// All nodes, ordered by id
    #[must_use]
    pub fn list(&self) -> Vec<NodeSnapshot> {
        let mut nodes: Vec<_> = self.nodes.values().map(NodeSnapshot::from).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Close every connection and fail all pending waits
    pub fn shutdown(&mut self) {
        for node in self.nodes.values_mut() {
            if node.state != ConnectionState::Lost {
                Self::lose(&self.events, node, PendingFailure::Shutdown);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
