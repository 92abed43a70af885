//! Capture-node runtime
//!
//! The device end of the control channel: registers with the controller,
//! answers heartbeats and commands, logs marker observations, and streams
//! telemetry in the corrected clock while modalities are active.

pub mod stream;

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use self::stream::NodeClock;
use crate::capture::{self, CaptureBackend, LoggingCapture};
use crate::error::{Error, Result};
use crate::protocol::{
    Command, CommandParams, CommandResponse, ControlMessage, DeviceStatus, MarkerKind,
    Modality, Registration, ResponseStatus, control,
};
use crate::telemetry::TelemetrySender;

/// Node identity and behavior
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub node_id: String,
    pub display_name: Option<String>,
    pub platform: String,
    /// Modality tags, e.g. `GSR`, `Thermal`, `RGB`
    pub capabilities: BTreeSet<String>,
    /// Seconds added to the system clock to model an unsynchronized device
    pub clock_skew: f64,
    /// Controller UDP telemetry address; no streaming without it
    pub telemetry_target: Option<SocketAddr>,
    pub handshake_timeout: Duration,
    pub battery_percent: u8,
    pub storage_free_mb: u64,
}

impl ClientConfig {
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            display_name: None,
            platform: std::env::consts::OS.to_string(),
            capabilities: BTreeSet::new(),
            clock_skew: 0.0,
            telemetry_target: None,
            handshake_timeout: Duration::from_secs(10),
            battery_percent: 100,
            storage_free_mb: 32_000,
        }
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_clock_skew(mut self, skew: f64) -> Self {
        self.clock_skew = skew;
        self
    }

    #[must_use]
    pub const fn with_telemetry(mut self, target: SocketAddr) -> Self {
        self.telemetry_target = Some(target);
        self
    }

    fn supports(&self, modality: &str) -> bool {
        self.capabilities
            .iter()
            .any(|c| c.eq_ignore_ascii_case(modality))
    }

    fn registration(&self) -> Registration {
        Registration {
            node_id: self.node_id.clone(),
            display_name: self.display_name.clone(),
            platform: self.platform.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// A marker as logged in the node's own data
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerObservationLog {
    pub marker_id: String,
    pub kind: MarkerKind,
    pub description: String,
    /// Node-local clock
    pub local: f64,
    /// Controller clock, if the node had an offset
    pub corrected: Option<f64>,
}

/// Why `run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// Controller closed the connection
    Disconnected,
    Shutdown,
}

#[derive(Default)]
struct NodeState {
    recording: bool,
    session_id: Option<String>,
    active: BTreeSet<String>,
    last_error: Option<String>,
    streams: BTreeMap<String, JoinHandle<()>>,
    markers: Vec<MarkerObservationLog>,
}

impl NodeState {
    fn stop_stream(&mut self, modality: &str) -> bool {
        self.streams.remove(modality).is_some_and(|task| {
            task.abort();
            true
        })
    }

    fn stop_all_streams(&mut self) {
        for (_, task) in std::mem::take(&mut self.streams) {
            task.abort();
        }
    }
}

/// Simulated or real capture node
#[derive(Clone)]
pub struct CaptureClient {
    config: Arc<ClientConfig>,
    backend: Arc<dyn CaptureBackend>,
    state: Arc<Mutex<NodeState>>,
    offset_tx: Arc<watch::Sender<Option<f64>>>,
    clock: NodeClock,
}

impl CaptureClient {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_backend(config, Arc::new(LoggingCapture))
    }

    #[must_use]
    pub fn with_backend(config: ClientConfig, backend: Arc<dyn CaptureBackend>) -> Self {
        let (offset_tx, offset_rx) = watch::channel(None);
        let clock = NodeClock::new(config.clock_skew, offset_rx);
        Self {
            config: Arc::new(config),
            backend,
            state: Arc::new(Mutex::new(NodeState::default())),
            offset_tx: Arc::new(offset_tx),
            clock,
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Offset last reported by the controller
    #[must_use]
    pub fn offset(&self) -> Option<f64> {
        self.clock.offset()
    }

    pub async fn status(&self) -> DeviceStatus {
        let state = self.state.lock().await;
        DeviceStatus {
            recording: state.recording,
            session_id: state.session_id.clone(),
            battery_percent: self.config.battery_percent,
            storage_free_mb: self.config.storage_free_mb,
            active_modalities: state.active.iter().cloned().collect(),
            last_error: state.last_error.clone(),
        }
    }

    /// Markers this node has logged, oldest first
    pub async fn markers(&self) -> Vec<MarkerObservationLog> {
        self.state.lock().await.markers.clone()
    }

    /// Connect over TCP and run until disconnected or shut down
    ///
    /// # Errors
    ///
    /// Returns error if the connection or handshake fails
    pub async fn connect(&self, controller: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<ClientExit> {
        let stream = tokio::net::TcpStream::connect(controller).await?;
        stream.set_nodelay(true)?;
        self.run(stream, shutdown).await
    }

    /// Run the protocol over an established stream
    ///
    /// # Errors
    ///
    /// Returns error if registration is refused or times out
    pub async fn run<S>(&self, stream: S, mut shutdown: watch::Receiver<bool>) -> Result<ClientExit>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let node_id = self.config.node_id.clone();
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();

        write_message(
            &mut writer,
            &ControlMessage::RegisterDevice {
                timestamp: self.clock.local(),
                registration: self.config.registration(),
            },
        )
        .await?;

        let first = tokio::time::timeout(self.config.handshake_timeout, lines.next_line())
            .await
            .map_err(|_| Error::Connection(format!("{node_id}: registration timed out")))??
            .ok_or_else(|| Error::Connection(format!("{node_id}: controller closed during registration")))?;

        let heartbeat = match control::decode(&first)? {
            ControlMessage::RegistrationConfirmed {
                heartbeat_interval_secs,
                ..
            } => Duration::from_secs(heartbeat_interval_secs.max(1)),
            other => {
                return Err(Error::Connection(format!(
                    "{node_id}: expected registration_confirmed, got {}",
                    other.kind_name()
                )));
            }
        };
        tracing::info!(node_id = %node_id, heartbeat_secs = heartbeat.as_secs(), "registered with controller");

        let telemetry = match self.config.telemetry_target {
            Some(target) => Some(Arc::new(TelemetrySender::bind(target).await?)),
            None => None,
        };

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break ClientExit::Disconnected,
                        Err(e) => {
                            tracing::debug!(node_id = %node_id, error = %e, "control read failed");
                            break ClientExit::Disconnected;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = match control::decode(&line) {
                        Ok(message) => self.handle(message, telemetry.as_ref()).await,
                        Err(e) => {
                            tracing::warn!(node_id = %node_id, error = %e, "dropping malformed control message");
                            None
                        }
                    };
                    if let Some(reply) = reply {
                        if let Err(e) = write_message(&mut writer, &reply).await {
                            tracing::debug!(node_id = %node_id, error = %e, "control write failed");
                            break ClientExit::Disconnected;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let beat = ControlMessage::Heartbeat {
                        device_id: node_id.clone(),
                        timestamp: self.clock.local(),
                    };
                    if write_message(&mut writer, &beat).await.is_err() {
                        break ClientExit::Disconnected;
                    }
                }
                _ = shutdown.changed() => break ClientExit::Shutdown,
            }
        };

        self.stop_capture_all().await;
        let _ = writer.shutdown().await;
        tracing::info!(node_id = %node_id, ?exit, "capture client stopped");
        Ok(exit)
    }

    async fn handle(
        &self,
        message: ControlMessage,
        telemetry: Option<&Arc<TelemetrySender>>,
    ) -> Option<ControlMessage> {
        match message {
            ControlMessage::Heartbeat { .. } => Some(ControlMessage::HeartbeatResponse {
                device_id: self.config.node_id.clone(),
                timestamp: self.clock.local(),
            }),
            ControlMessage::Command(command) => {
                let mut response = self.execute(&command, telemetry).await;
                response.timestamp = self.clock.local();
                Some(ControlMessage::Response(response))
            }
            ControlMessage::HeartbeatResponse { .. } => None,
            other => {
                tracing::debug!(kind = other.kind_name(), "ignoring unexpected control message");
                None
            }
        }
    }

    async fn execute(&self, command: &Command, telemetry: Option<&Arc<TelemetrySender>>) -> CommandResponse {
        let node_id = self.config.node_id.as_str();
        let reply = |status: ResponseStatus| CommandResponse::reply(command, node_id, status);

        match &command.params {
            CommandParams::Start { modalities } => self.start(command, modalities, telemetry).await,
            CommandParams::Stop => {
                self.stop_capture_all().await;
                reply(ResponseStatus::Success).with_report(self.status().await)
            }
            CommandParams::GetStatus => reply(ResponseStatus::Success).with_report(self.status().await),
            CommandParams::SyncTime { last_offset } => {
                if let Some(offset) = last_offset {
                    self.offset_tx.send_replace(Some(*offset));
                    tracing::debug!(node_id = %node_id, offset_ms = offset * 1000.0, "clock offset updated");
                }
                reply(ResponseStatus::Success)
            }
            CommandParams::MarkEvent {
                marker_id,
                marker_kind,
                description,
            } => {
                let local = self.clock.local();
                let corrected = self.clock.corrected(local);
                tracing::info!(
                    node_id = %node_id,
                    marker_id = %marker_id,
                    kind = %marker_kind,
                    local,
                    corrected = ?corrected,
                    "sync marker observed"
                );
                self.state.lock().await.markers.push(MarkerObservationLog {
                    marker_id: marker_id.clone(),
                    kind: *marker_kind,
                    description: description.clone(),
                    local,
                    corrected,
                });
                reply(ResponseStatus::Success)
            }
            CommandParams::StartStream { modality } => {
                if !self.config.supports(modality) {
                    return reply(ResponseStatus::NotSupported)
                        .with_message(format!("no {modality} capability"));
                }
                let mut state = self.state.lock().await;
                if self.spawn_stream(&mut state, modality, telemetry) {
                    reply(ResponseStatus::Success)
                } else {
                    reply(ResponseStatus::NotSupported).with_message(format!("{modality} cannot be streamed"))
                }
            }
            CommandParams::StopStream { modality } => {
                if !self.config.supports(modality) {
                    return reply(ResponseStatus::NotSupported)
                        .with_message(format!("no {modality} capability"));
                }
                self.state.lock().await.stop_stream(modality);
                reply(ResponseStatus::Success)
            }
        }
    }

    async fn start(
        &self,
        command: &Command,
        requested: &[String],
        telemetry: Option<&Arc<TelemetrySender>>,
    ) -> CommandResponse {
        let node_id = self.config.node_id.as_str();
        let mut state = self.state.lock().await;
        if state.recording {
            let current = state.session_id.clone().unwrap_or_default();
            return CommandResponse::reply(command, node_id, ResponseStatus::Busy)
                .with_message(format!("already recording {current}"));
        }

        let modalities: Vec<String> = if requested.is_empty() {
            self.config.capabilities.iter().cloned().collect()
        } else {
            requested
                .iter()
                .filter(|m| self.config.supports(m))
                .cloned()
                .collect()
        };
        if modalities.is_empty() && !requested.is_empty() {
            return CommandResponse::reply(command, node_id, ResponseStatus::NotSupported)
                .with_message(format!("none of {} supported", requested.join(", ")));
        }

        let mut started: Vec<&str> = Vec::new();
        for modality in &modalities {
            if let Err(e) = self
                .backend
                .start_capture(modality, command.session_id.as_deref())
                .await
            {
                for done in started {
                    if let Err(rollback) = self.backend.stop_capture(done).await {
                        tracing::warn!(node_id = %node_id, modality = done, error = %rollback, "rollback stop failed");
                    }
                }
                state.last_error = Some(e.to_string());
                return CommandResponse::reply(command, node_id, ResponseStatus::Error)
                    .with_message(e.to_string());
            }
            started.push(modality.as_str());
        }

        state.recording = true;
        state.session_id.clone_from(&command.session_id);
        state.last_error = None;
        for modality in &modalities {
            state.active.insert(modality.clone());
            self.spawn_stream(&mut state, modality, telemetry);
        }
        tracing::info!(node_id = %node_id, session_id = ?command.session_id, ?modalities, "recording started");

        let report = DeviceStatus {
            recording: true,
            session_id: state.session_id.clone(),
            battery_percent: self.config.battery_percent,
            storage_free_mb: self.config.storage_free_mb,
            active_modalities: state.active.iter().cloned().collect(),
            last_error: None,
        };
        CommandResponse::reply(command, node_id, ResponseStatus::Success).with_report(report)
    }

    /// Start streaming a modality if it has a source; true when streaming
    fn spawn_stream(
        &self,
        state: &mut NodeState,
        modality: &str,
        telemetry: Option<&Arc<TelemetrySender>>,
    ) -> bool {
        if state.streams.contains_key(modality) {
            return true;
        }
        let Some(source) = Modality::from_capability(modality).and_then(capture::simulated_source) else {
            return false;
        };
        let Some(sender) = telemetry else {
            tracing::debug!(node_id = %self.config.node_id, modality, "no telemetry target, not streaming");
            return true;
        };
        let task = stream::spawn(
            self.config.node_id.clone(),
            source,
            self.clock.clone(),
            Arc::clone(sender),
        );
        state.streams.insert(modality.to_string(), task);
        true
    }

    async fn stop_capture_all(&self) {
        let mut state = self.state.lock().await;
        state.stop_all_streams();
        for modality in std::mem::take(&mut state.active) {
            if let Err(e) = self.backend.stop_capture(&modality).await {
                tracing::warn!(node_id = %self.config.node_id, modality, error = %e, "stop capture failed");
                state.last_error = Some(e.to_string());
            }
        }
        if state.recording {
            tracing::info!(node_id = %self.config.node_id, session_id = ?state.session_id, "recording stopped");
        }
        state.recording = false;
        state.session_id = None;
    }
}

async fn write_message<W>(writer: &mut WriteHalf<W>, message: &ControlMessage) -> Result<()>
where
    W: AsyncRead + AsyncWrite,
{
    let line = control::encode(message)?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
