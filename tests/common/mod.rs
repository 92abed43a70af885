//! Shared test utilities

#![allow(dead_code)]

use std::time::Duration;

use capture_sync::client::{CaptureClient, ClientConfig, ClientExit};
use capture_sync::nodes::ConnectionState;
use capture_sync::protocol::{
    Command, CommandResponse, ControlMessage, Registration, ResponseStatus, control,
};
use capture_sync::{Config, ConnectionManager, Coordinator};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Control-connection address reported for in-memory clients; their
/// telemetry is sent from loopback
const LOOPBACK_PEER: &str = "127.0.0.1:0";

/// Short deadlines so timeouts resolve quickly
#[must_use]
pub fn test_config() -> Config {
    Config {
        bind: "127.0.0.1".to_string(),
        command_timeout_ms: 300,
        start_timeout_ms: 300,
        idempotent_retries: 0,
        advertise: false,
        ..Config::default()
    }
}

/// A controller plus the shutdown signal its clients listen to
pub struct Harness {
    pub coordinator: Coordinator,
    pub shutdown: watch::Sender<bool>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            coordinator: Coordinator::new(config).await,
            shutdown,
        }
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        self.coordinator.manager()
    }

    /// Connect a capture client over an in-memory stream and wait until it is active
    pub async fn client(&self, config: ClientConfig) -> (CaptureClient, JoinHandle<ClientExit>) {
        let node_id = config.node_id.clone();
        let (controller_side, node_side) = tokio::io::duplex(DUPLEX_BUFFER);
        self.manager().accept(controller_side, LOOPBACK_PEER.to_string());

        let client = CaptureClient::new(config);
        let runner = client.clone();
        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move { runner.run(node_side, shutdown).await.expect("client failed") });

        assert!(
            wait_for_state(self.manager(), &node_id, ConnectionState::Active).await,
            "{node_id} never became active"
        );
        (client, task)
    }

    /// Connect a scripted peer and wait until it is active
    pub async fn peer(&self, node_id: &str) -> RawPeer {
        self.peer_at(node_id, &format!("mem:{node_id}")).await
    }

    /// Scripted peer whose control connection appears to come from `address`
    pub async fn peer_at(&self, node_id: &str, address: &str) -> RawPeer {
        let (controller_side, node_side) = tokio::io::duplex(DUPLEX_BUFFER);
        self.manager().accept(controller_side, address.to_string());
        let peer = RawPeer::register(node_id, node_side).await;
        assert!(
            wait_for_state(self.manager(), node_id, ConnectionState::Active).await,
            "{node_id} never became active"
        );
        peer
    }
}

/// Client that records GSR, skewed by `skew` seconds
#[must_use]
pub fn gsr_node(node_id: &str, skew: f64) -> ClientConfig {
    ClientConfig::new(node_id)
        .with_capabilities(["GSR"])
        .with_clock_skew(skew)
}

/// Poll until the node reaches `state` (two second budget)
pub async fn wait_for_state(manager: &ConnectionManager, node_id: &str, state: ConnectionState) -> bool {
    for _ in 0..200 {
        if manager.state(node_id).await == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Node-side control channel driven by the test itself
pub struct RawPeer {
    pub node_id: String,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl RawPeer {
    async fn register(node_id: &str, stream: DuplexStream) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        let mut peer = Self {
            node_id: node_id.to_string(),
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        peer.send(&ControlMessage::RegisterDevice {
            timestamp: 0.0,
            registration: Registration {
                node_id: node_id.to_string(),
                platform: "test".to_string(),
                ..Registration::default()
            },
        })
        .await;
        match peer.recv().await {
            Some(ControlMessage::RegistrationConfirmed { .. }) => peer,
            other => panic!("expected registration_confirmed, got {other:?}"),
        }
    }

    pub async fn send(&mut self, message: &ControlMessage) {
        let line = control::encode(message).expect("encodable message");
        self.send_line(&line).await;
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next decoded message, `None` once the controller closes
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("controller went quiet")
            .ok()??;
        Some(control::decode(&line).expect("controller sent a malformed line"))
    }

    /// Next command, skipping heartbeats
    pub async fn next_command(&mut self) -> Command {
        loop {
            match self.recv().await {
                Some(ControlMessage::Command(command)) => return command,
                Some(_) => {}
                None => panic!("controller closed before sending a command"),
            }
        }
    }

    /// Acknowledge `command` with `status`, stamped `timestamp`
    pub async fn reply(&mut self, command: &Command, status: ResponseStatus, timestamp: f64) {
        let mut response = CommandResponse::reply(command, self.node_id.clone(), status);
        response.timestamp = timestamp;
        self.send(&ControlMessage::Response(response)).await;
    }
}
