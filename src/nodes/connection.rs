//! Per-node control connection tasks
//!
//! Each accepted stream is split into a reader task (line reads, decode,
//! enqueue onto the node's inbound queue), a writer task (drains the node's
//! outbound queue) and a handler loop that applies inbound messages to the
//! registry in socket order.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::manager::ConnectionManager;
use crate::clock;
use crate::error::{CodecError, Error, Result};
use crate::protocol::{ControlMessage, control};

const INBOUND_CAPACITY: usize = 256;

/// Sliding-window counter of malformed messages
#[derive(Debug)]
pub struct BurstCounter {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl BurstCounter {
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: VecDeque::new(),
        }
    }

    /// Record one malformed message; true once the burst limit is exceeded
    pub fn record(&mut self, now: Instant) -> bool {
        while self
            .hits
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > self.window)
        {
            self.hits.pop_front();
        }
        self.hits.push_back(now);
        self.hits.len() > self.limit
    }
}

/// Drive one control connection from handshake to close
///
/// # Errors
///
/// Returns error if the handshake fails; after registration all failures are
/// absorbed by marking the node lost
pub(crate) async fn serve<S>(manager: ConnectionManager, stream: S, peer: String) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let settings = manager.settings().clone();
    let (read_half, mut write_half) = tokio::io::split(stream);
    let max_line = settings.max_line_bytes;
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(max_line));

    tracing::debug!(peer = %peer, "control connection opened, awaiting registration");

    let first = tokio::time::timeout(settings.handshake_timeout, lines.next())
        .await
        .map_err(|_| Error::Connection(format!("{peer}: handshake timed out")))?
        .ok_or_else(|| Error::Connection(format!("{peer}: closed before registration")))?
        .map_err(|e| match e {
            LinesCodecError::MaxLineLengthExceeded => Error::Protocol(overlong(max_line)),
            LinesCodecError::Io(e) => Error::Io(e),
        })?;

    let registration = match control::decode(&first)? {
        ControlMessage::RegisterDevice { registration, .. } => registration,
        other => {
            return Err(Error::Connection(format!(
                "{peer}: expected register_device, got {}",
                other.kind_name()
            )));
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(settings.outbound_capacity);
    let link = manager.register(registration, outbound_tx.clone()).await?;
    let node_id = link.node_id.clone();
    let instance_id = link.instance_id;
    let mut closed = link.closed;
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        manager.bind_address(&node_id, instance_id, addr.ip()).await;
    }

    let writer_node = node_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let line = match control::encode(&message) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(node_id = %writer_node, error = %e, "dropping unencodable message");
                    continue;
                }
            };
            let written = async {
                write_half.write_all(line.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
                write_half.flush().await
            };
            if let Err(e) = written.await {
                tracing::debug!(node_id = %writer_node, error = %e, "control write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let confirmation = ControlMessage::RegistrationConfirmed {
        device_id: node_id.clone(),
        timestamp: clock::now_seconds(),
        heartbeat_interval_secs: settings.heartbeat_interval.as_secs(),
    };
    if outbound_tx.send(confirmation).await.is_err() {
        manager.mark_lost(&node_id, instance_id, "write failed during handshake").await;
        writer.abort();
        return Ok(());
    }
    manager.activate(&node_id, instance_id).await;

    let (inbound_tx, mut inbound_rx) =
        mpsc::channel::<std::result::Result<ControlMessage, CodecError>>(INBOUND_CAPACITY);
    let reader_node = node_id.clone();
    let reader = tokio::spawn(async move {
        // after a codec error the stream yields one `None` before reading on
        let mut after_error = false;
        loop {
            let decoded = match lines.next().await {
                None if after_error => {
                    after_error = false;
                    continue;
                }
                None => break,
                Some(Ok(line)) => {
                    after_error = false;
                    if line.trim().is_empty() {
                        continue;
                    }
                    control::decode(&line)
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    after_error = true;
                    Err(overlong(max_line))
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    tracing::debug!(node_id = %reader_node, error = %e, "control read failed");
                    break;
                }
            };
            if inbound_tx.send(decoded).await.is_err() {
                break;
            }
        }
    });

    let mut burst = BurstCounter::new(
        settings.malformed_burst_limit,
        settings.malformed_burst_window,
    );

    let reason = loop {
        tokio::select! {
            inbound = inbound_rx.recv() => match inbound {
                None => break "connection closed",
                Some(Ok(message)) => {
                    manager.record_traffic(&node_id, instance_id).await;
                    handle_message(&manager, &node_id, &outbound_tx, message).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(node_id = %node_id, error = %e, "dropping malformed control message");
                    if burst.record(Instant::now()) {
                        break "malformed message burst";
                    }
                }
            },
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break "closed by controller";
                }
            }
        }
    };

    reader.abort();
    drop(outbound_tx);
    manager.mark_lost(&node_id, instance_id, reason).await;
    writer.abort();
    tracing::info!(node_id = %node_id, peer = %peer, reason, "control connection closed");

    Ok(())
}

fn overlong(max_line: usize) -> CodecError {
    CodecError::Malformed(format!("control line longer than {max_line} bytes"))
}

async fn handle_message(
    manager: &ConnectionManager,
    node_id: &str,
    outbound: &mpsc::Sender<ControlMessage>,
    message: ControlMessage,
) {
    match message {
        ControlMessage::Heartbeat { .. } => {
            let reply = ControlMessage::HeartbeatResponse {
                device_id: node_id.to_string(),
                timestamp: clock::now_seconds(),
            };
            if outbound.try_send(reply).is_err() {
                tracing::debug!(node_id = %node_id, "heartbeat response not queued");
            }
        }
        ControlMessage::HeartbeatResponse { .. } => {}
        ControlMessage::Response(mut response) => {
            // the connection identity wins over the envelope
            if response.node_id != node_id {
                tracing::debug!(
                    node_id = %node_id,
                    claimed = %response.node_id,
                    "response device id differs from connection"
                );
                response.node_id = node_id.to_string();
            }
            manager.deliver_response(response).await;
        }
        ControlMessage::RegisterDevice { .. } => {
            tracing::warn!(node_id = %node_id, "duplicate registration ignored");
        }
        other => {
            tracing::warn!(node_id = %node_id, kind = other.kind_name(), "unexpected message from node ignored");
        }
    }
}
