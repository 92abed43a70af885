//! Capture node records and connection state

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::clock::{ClockOffsetEstimator, SyncQuality};
use crate::protocol::{Command, CommandKind, CommandResponse, ControlMessage};

/// Per-connection lifecycle
///
/// `CONNECTING → REGISTERED → ACTIVE ⇄ DEGRADED → LOST`. LOST is terminal
/// for the connection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Registered,
    Active,
    Degraded,
    Lost,
}

impl ConnectionState {
    /// Whether commands may be sent
    #[must_use]
    pub const fn is_reachable(self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Registered => "REGISTERED",
            Self::Active => "ACTIVE",
            Self::Degraded => "DEGRADED",
            Self::Lost => "LOST",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pending command wait ended without a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFailure {
    /// The node went LOST while the command was outstanding
    NodeLost,
    /// The controller is shutting down
    Shutdown,
}

pub type PendingResult = Result<CommandResponse, PendingFailure>;

/// An outstanding command slot awaiting its response
#[derive(Debug)]
pub struct PendingCommand {
    pub kind: CommandKind,
    pub sent_at: Instant,
    pub reply: oneshot::Sender<PendingResult>,
}

/// One registered connection instance
///
/// Owned by the registry. Other components refer to nodes by id only.
#[derive(Debug)]
pub struct CaptureNode {
    pub node_id: String,
    /// Distinguishes re-registrations that reuse the same id
    pub instance_id: Uuid,
    pub display_name: Option<String>,
    pub platform: String,
    pub capabilities: BTreeSet<String>,
    /// Source address of the control connection; telemetry must come from it
    pub address: Option<IpAddr>,
    pub state: ConnectionState,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub last_seen: Instant,
    pub clock: ClockOffsetEstimator,
    pub(crate) next_seq: u64,
    pub(crate) pending: HashMap<u64, PendingCommand>,
    pub(crate) outbound: Option<mpsc::Sender<ControlMessage>>,
    pub(crate) close: watch::Sender<bool>,
    pub(crate) lost_ticks: u32,
}

/// Handed to the connection task after a successful handshake
#[derive(Debug)]
pub struct NodeLink {
    pub node_id: String,
    pub instance_id: Uuid,
    /// Flips to `true` when the registry wants the connection closed
    pub closed: watch::Receiver<bool>,
}

/// A command with its allocated sequence number, ready for the wire
#[derive(Debug)]
pub struct PreparedCommand {
    pub instance_id: Uuid,
    pub command: Command,
    pub reply: oneshot::Receiver<PendingResult>,
    pub outbound: mpsc::Sender<ControlMessage>,
}

/// Read-only view of a node for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub node_id: String,
    pub instance_id: Uuid,
    pub display_name: Option<String>,
    pub platform: String,
    pub capabilities: BTreeSet<String>,
    pub address: Option<IpAddr>,
    pub state: ConnectionState,
    pub connected_at: String,
    pub last_seen_secs_ago: f64,
    pub clock: SyncQuality,
    /// Human-readable sync quality, e.g. `sync accuracy: ±38 ms`
    pub sync: String,
    pub pending_commands: usize,
}

impl From<&CaptureNode> for NodeSnapshot {
    fn from(node: &CaptureNode) -> Self {
        let quality = node.clock.quality();
        Self {
            node_id: node.node_id.clone(),
            instance_id: node.instance_id,
            display_name: node.display_name.clone(),
            platform: node.platform.clone(),
            capabilities: node.capabilities.clone(),
            address: node.address,
            state: node.state,
            connected_at: node.connected_at.to_rfc3339(),
            last_seen_secs_ago: node.last_seen.elapsed().as_secs_f64(),
            clock: quality,
            sync: quality.to_string(),
            pending_commands: node.pending.len(),
        }
    }
}

/// Registry change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    StateChanged {
        node_id: String,
        instance_id: Uuid,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Record destroyed (unregistered, pruned, or replaced)
    Removed { node_id: String, instance_id: Uuid },
}

impl NodeEvent {
    #[must_use]
    pub fn node_id(&self) -> &str {
        match self {
            Self::StateChanged { node_id, .. } | Self::Removed { node_id, .. } => node_id,
        }
    }
}

/// Nodes whose state changed during one liveness tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub degraded: Vec<String>,
    pub lost: Vec<String>,
    pub pruned: Vec<String>,
}

impl LivenessReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.degraded.is_empty() && self.lost.is_empty() && self.pruned.is_empty()
    }
}
