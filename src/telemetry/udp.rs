//! UDP transport for telemetry frames

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::hub::TelemetryHub;
use crate::error::{CodecError, Result};
use crate::nodes::ConnectionManager;
use crate::protocol::telemetry::{self, response_from_frame};
use crate::protocol::{Modality, TelemetryFrame};

/// Largest datagram the receiver accepts
const MAX_DATAGRAM: usize = 64 * 1024;

/// Receive telemetry datagrams until shutdown
///
/// Only frames from a reachable node, sent from the address its control
/// connection came from, are accepted. Response frames are routed to their
/// pending command (and mirrored from there); every other frame is published
/// on its stream. Undecodable or unattributable datagrams are dropped.
///
/// # Errors
///
/// Returns error if the socket address cannot be read
pub async fn run_receiver(
    socket: UdpSocket,
    hub: TelemetryHub,
    manager: ConnectionManager,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tracing::info!(addr = %socket.local_addr()?, "telemetry channel listening");
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP errors from earlier sends surface here
                        tracing::debug!(error = %e, "telemetry receive failed");
                        continue;
                    }
                };
                match telemetry::decode(&buf[..len]) {
                    Ok(frame) => route(frame, peer, &hub, &manager).await,
                    Err(e) => {
                        tracing::debug!(peer = %peer, bytes = len, error = %e, "telemetry datagram dropped");
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("telemetry receiver stopped");
    Ok(())
}

async fn route(frame: TelemetryFrame, peer: SocketAddr, hub: &TelemetryHub, manager: &ConnectionManager) {
    if !manager.admit_datagram(&frame.node_id, peer.ip()).await {
        tracing::debug!(peer = %peer, node_id = %frame.node_id, "datagram from unbound source dropped");
        return;
    }
    if frame.modality() == Some(Modality::CommandResponse) {
        match response_from_frame(frame) {
            Ok(response) => {
                manager.deliver_response(response).await;
            }
            Err(e) => tracing::debug!(peer = %peer, error = %e, "response frame dropped"),
        }
        return;
    }
    hub.publish(frame).await;
}

/// Node-side telemetry sender
pub struct TelemetrySender {
    socket: UdpSocket,
    target: SocketAddr,
}

impl TelemetrySender {
    /// Bind an ephemeral local port aimed at `target`
    ///
    /// # Errors
    ///
    /// Returns error if no local socket can be bound
    pub async fn bind(target: SocketAddr) -> Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self { socket, target })
    }

    #[must_use]
    pub const fn target(&self) -> SocketAddr {
        self.target
    }

    /// Encode and send one frame
    ///
    /// # Errors
    ///
    /// Returns a codec error for an unencodable frame or an I/O error
    pub async fn send(&self, frame: &TelemetryFrame) -> Result<usize> {
        let bytes = telemetry::encode(frame)?;
        if bytes.len() > MAX_DATAGRAM {
            return Err(CodecError::SchemaViolation(format!(
                "frame of {} bytes exceeds datagram limit",
                bytes.len()
            ))
            .into());
        }
        Ok(self.socket.send_to(&bytes, self.target).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::nodes::ConnectionSettings;
    use crate::protocol::telemetry::{GsrSample, response_frame};
    use crate::protocol::{
        Command, CommandKind, CommandParams, CommandResponse, ControlMessage, Registration,
        ResponseStatus, TelemetryPayload,
    };

    fn gsr(node_id: &str) -> TelemetryFrame {
        TelemetryFrame::new(
            node_id,
            TelemetryPayload::Gsr(GsrSample {
                timestamp: 42.0,
                conductance: 2.0,
                resistance: 500.0,
                quality: 0.9,
            }),
        )
    }

    /// Active node whose control connection came from `address`
    async fn bound_node(manager: &ConnectionManager, node_id: &str, address: [u8; 4]) -> mpsc::Receiver<ControlMessage> {
        let (tx, rx) = mpsc::channel(8);
        let registration = Registration {
            node_id: node_id.to_string(),
            ..Registration::default()
        };
        let link = manager.register(registration, tx).await.unwrap();
        manager.activate(node_id, link.instance_id).await;
        assert!(manager.bind_address(node_id, link.instance_id, address.into()).await);
        rx
    }

    #[tokio::test]
    async fn frames_reach_subscribers_over_udp() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hub = TelemetryHub::new(16);
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let _control = bound_node(&manager, "n1", [127, 0, 0, 1]).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut rx = hub.subscribe("GSR_n1").await.unwrap();

        let task = tokio::spawn(run_receiver(socket, hub.clone(), manager, shutdown_rx));

        let sender = TelemetrySender::bind(addr).await.unwrap();
        // garbage first: the receiver must drop it and keep going
        sender.socket.send_to(&[0xff, 0xff, 0xff], addr).await.unwrap();
        sender.send(&gsr("n1")).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.node_id, "n1");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unattributable_frames_are_dropped() {
        let hub = TelemetryHub::new(16);
        let manager = ConnectionManager::new(ConnectionSettings::default());
        let _remote = bound_node(&manager, "remote", [10, 0, 0, 9]).await;
        let _local = bound_node(&manager, "local", [127, 0, 0, 1]).await;
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        // unknown ids never open a stream
        for i in 0..50 {
            route(gsr(&format!("ghost-{i}")), peer, &hub, &manager).await;
        }
        // right id, wrong source
        route(gsr("remote"), peer, &hub, &manager).await;
        assert!(hub.streams().await.is_empty());

        // an ack for a pending command from a foreign source does not resolve it
        let in_flight = manager
            .send("remote", Command::new(CommandParams::GetStatus))
            .await
            .unwrap();
        let forged = CommandResponse {
            seq: in_flight.seq,
            kind: CommandKind::GetStatus,
            status: ResponseStatus::Success,
            node_id: "remote".to_string(),
            timestamp: 1.0,
            message: String::new(),
            report: None,
        };
        route(response_frame(&forged).unwrap(), peer, &hub, &manager).await;
        assert_eq!(manager.get("remote").await.unwrap().pending_commands, 1);

        route(gsr("local"), peer, &hub, &manager).await;
        assert_eq!(hub.streams().await.len(), 1);
    }
}
