//! Connection manager: registry ownership, command send, liveness
//!
//! All registry mutations go through this type. Locks are held only for
//! short, non-blocking registry operations; no network I/O happens under the
//! lock.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::connection;
use super::registry::{NodeRegistry, SharedNodeRegistry};
use super::types::{
    ConnectionState, LivenessReport, NodeEvent, NodeLink, NodeSnapshot, PendingResult,
};
use crate::clock::{self, ClockSample, ClockSyncError};
use crate::config::Config;
use crate::error::{RegisterError, SendError};
use crate::protocol::{Command, CommandResponse, ControlMessage, Registration};

const RESPONSE_CAPACITY: usize = 256;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Connection-level tunables
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub lost_retention_ticks: u32,
    pub handshake_timeout: Duration,
    pub outbound_capacity: usize,
    pub malformed_burst_limit: usize,
    pub malformed_burst_window: Duration,
    /// Longest control line accepted; longer lines count as malformed
    pub max_line_bytes: usize,
    pub latency_ceiling: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            lost_retention_ticks: 3,
            handshake_timeout: Duration::from_secs(10),
            outbound_capacity: 64,
            malformed_burst_limit: 10,
            malformed_burst_window: Duration::from_secs(5),
            max_line_bytes: 64 * 1024,
            latency_ceiling: clock::DEFAULT_LATENCY_CEILING,
        }
    }
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            lost_retention_ticks: config.lost_retention_ticks,
            malformed_burst_limit: config.malformed_burst_limit,
            malformed_burst_window: config.malformed_burst_window(),
            latency_ceiling: config.sync_latency_ceiling(),
            ..Self::default()
        }
    }
}

/// A command handed to a node's outbound queue
#[derive(Debug)]
pub struct InFlight {
    pub node_id: String,
    pub instance_id: Uuid,
    pub seq: u64,
    /// Controller clock when the command was queued (`t0` for clock sync)
    pub sent_at: f64,
    pub reply: oneshot::Receiver<PendingResult>,
}

/// Controller-side connection manager
#[derive(Clone)]
pub struct ConnectionManager {
    registry: SharedNodeRegistry,
    settings: ConnectionSettings,
    responses: broadcast::Sender<CommandResponse>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(settings: ConnectionSettings) -> Self {
        let registry = Arc::new(Mutex::new(NodeRegistry::new(settings.latency_ceiling)));
        let (responses, _) = broadcast::channel(RESPONSE_CAPACITY);
        Self {
            registry,
            settings,
            responses,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    #[must_use]
    pub fn registry(&self) -> SharedNodeRegistry {
        self.registry.clone()
    }

    /// Subscribe to node state-change events
    pub async fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.registry.lock().await.subscribe()
    }

    /// Subscribe to every response received from any node
    #[must_use]
    pub fn subscribe_responses(&self) -> broadcast::Receiver<CommandResponse> {
        self.responses.subscribe()
    }

    /// Register a node over an already-established outbound queue
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` or `Malformed`
    pub async fn register(
        &self,
        registration: Registration,
        outbound: mpsc::Sender<ControlMessage>,
    ) -> std::result::Result<NodeLink, RegisterError> {
        self.registry.lock().await.register(registration, outbound)
    }

    pub async fn activate(&self, node_id: &str, instance_id: Uuid) -> bool {
        self.registry.lock().await.activate(node_id, instance_id)
    }

    pub async fn record_traffic(&self, node_id: &str, instance_id: Uuid) {
        self.registry
            .lock()
            .await
            .record_traffic(node_id, instance_id);
    }

    pub async fn bind_address(&self, node_id: &str, instance_id: Uuid, address: IpAddr) -> bool {
        self.registry
            .lock()
            .await
            .bind_address(node_id, instance_id, address)
    }

    /// Accept a datagram claiming to be from `node_id` only if it came from
    /// the node's control-connection address; counts as traffic when accepted
    pub async fn admit_datagram(&self, node_id: &str, source: IpAddr) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(instance_id) = registry.datagram_instance(node_id, source) else {
            return false;
        };
        registry.record_traffic(node_id, instance_id);
        true
    }

    pub async fn mark_lost(&self, node_id: &str, instance_id: Uuid, reason: &str) -> bool {
        self.registry
            .lock()
            .await
            .mark_lost(node_id, instance_id, reason)
    }

    pub async fn unregister(&self, node_id: &str) -> Option<NodeSnapshot> {
        self.registry.lock().await.unregister(node_id)
    }

    /// Queue a command on a node's connection
    ///
    /// The command is restamped with the current controller time and assigned
    /// the connection's next sequence number.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless the node is ACTIVE or DEGRADED, and
    /// `WriteFailed` if the outbound queue is closed or full
    pub async fn send(
        &self,
        node_id: &str,
        command: Command,
    ) -> std::result::Result<InFlight, SendError> {
        let prepared = self.registry.lock().await.prepare_command(node_id, command)?;
        let mut command = prepared.command;
        let seq = command.seq;
        command.origin_timestamp = clock::now_seconds();
        let sent_at = command.origin_timestamp;
        let kind = command.kind();

        if let Err(e) = prepared.outbound.try_send(ControlMessage::Command(command)) {
            tracing::warn!(node_id = %node_id, seq, %kind, error = %e, "command write failed");
            self.release(node_id, prepared.instance_id, seq).await;
            return Err(SendError::WriteFailed(node_id.to_string()));
        }

        tracing::debug!(node_id = %node_id, seq, %kind, "command sent");
        Ok(InFlight {
            node_id: node_id.to_string(),
            instance_id: prepared.instance_id,
            seq,
            sent_at,
            reply: prepared.reply,
        })
    }

    /// Free an abandoned command slot
    pub async fn release(&self, node_id: &str, instance_id: Uuid, seq: u64) -> bool {
        self.registry
            .lock()
            .await
            .release(node_id, instance_id, seq)
    }

    /// Route a response to its waiter and to response subscribers
    pub async fn deliver_response(&self, response: CommandResponse) -> bool {
        let _ = self.responses.send(response.clone());
        self.registry.lock().await.resolve(response)
    }

    pub async fn observe_clock(
        &self,
        node_id: &str,
        t0: f64,
        t1: f64,
        t2: f64,
    ) -> Option<std::result::Result<ClockSample, ClockSyncError>> {
        self.registry
            .lock()
            .await
            .observe_clock(node_id, t0, t1, t2)
    }

    pub async fn offset(&self, node_id: &str) -> Option<f64> {
        self.registry.lock().await.offset(node_id)
    }

    pub async fn broadcast_targets(&self) -> Vec<(String, ConnectionState)> {
        self.registry.lock().await.broadcast_targets()
    }

    pub async fn resync_due(&self, interval: Duration) -> Vec<String> {
        self.registry
            .lock()
            .await
            .resync_due(Instant::now(), interval)
    }

    pub async fn state(&self, node_id: &str) -> Option<ConnectionState> {
        self.registry.lock().await.state(node_id)
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeSnapshot> {
        self.registry.lock().await.get(node_id)
    }

    pub async fn list(&self) -> Vec<NodeSnapshot> {
        self.registry.lock().await.list()
    }

    /// One liveness pass at the current instant
    pub async fn liveness_tick(&self) -> LivenessReport {
        let report = self.registry.lock().await.liveness_tick(
            Instant::now(),
            self.settings.heartbeat_interval,
            self.settings.lost_retention_ticks,
        );
        if !report.is_empty() {
            tracing::debug!(
                degraded = report.degraded.len(),
                lost = report.lost.len(),
                pruned = report.pruned.len(),
                "liveness tick"
            );
        }
        report
    }

    /// Run liveness ticks on a fixed interval until shutdown
    #[must_use]
    pub fn spawn_liveness(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let period = manager.settings.heartbeat_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.liveness_tick().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("liveness task stopped");
        })
    }

    /// Serve an accepted control stream on its own task
    pub fn accept<S>(&self, stream: S, peer: String) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = connection::serve(manager, stream, peer.clone()).await {
                tracing::warn!(peer = %peer, error = %e, "control connection rejected");
            }
        })
    }

    /// Accept control connections until shutdown
    ///
    /// Accept failures (aborted handshakes, descriptor exhaustion) are logged
    /// and retried after a short pause; only shutdown ends the loop.
    pub async fn listen(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(addr = ?listener.local_addr().ok(), "control channel listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => self.on_accept(accepted).await,
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("control listener stopped");
    }

    async fn on_accept(&self, accepted: std::io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(peer = %addr, error = %e, "set_nodelay failed");
                }
                self.accept(stream, addr.to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "control accept failed, retrying");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    /// Close every connection and fail all outstanding waits
    pub async fn shutdown(&self) {
        self.registry.lock().await.shutdown();
        tracing::info!("connection manager shut down");
    }
}
