//! Per-stream broadcast channels with discovery

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use super::sink::FrameSink;
use crate::protocol::telemetry::response_frame;
use crate::protocol::{CommandResponse, Modality, TelemetryFrame};

/// Discoverable description of one stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    /// `<Modality>_<nodeId>`
    pub name: String,
    pub modality: Modality,
    pub node_id: String,
    pub nominal_rate: Option<f64>,
    pub channel_count: usize,
    pub frames: u64,
    /// Embedded timestamp of the newest frame, controller clock
    pub last_timestamp: Option<f64>,
    pub subscribers: usize,
}

struct Stream {
    modality: Modality,
    node_id: String,
    frames: u64,
    last_timestamp: Option<f64>,
    tx: broadcast::Sender<TelemetryFrame>,
}

impl Stream {
    fn new(modality: Modality, node_id: &str, buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            modality,
            node_id: node_id.to_string(),
            frames: 0,
            last_timestamp: None,
            tx,
        }
    }

    fn info(&self, name: &str) -> StreamInfo {
        StreamInfo {
            name: name.to_string(),
            modality: self.modality,
            node_id: self.node_id.clone(),
            nominal_rate: self.modality.nominal_rate(),
            channel_count: self.modality.channel_count(),
            frames: self.frames,
            last_timestamp: self.last_timestamp,
            subscribers: self.tx.receiver_count(),
        }
    }
}

#[derive(Default)]
struct HubInner {
    streams: HashMap<String, Stream>,
    sinks: Vec<Arc<dyn FrameSink>>,
}

/// Fan-out point for every telemetry stream
///
/// Each stream is a bounded broadcast ring; a subscriber that falls more
/// than `buffer` frames behind skips ahead and sees `Lagged`.
#[derive(Clone)]
pub struct TelemetryHub {
    inner: Arc<RwLock<HubInner>>,
    buffer: usize,
}

impl TelemetryHub {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HubInner::default())),
            buffer: buffer.max(1),
        }
    }

    /// Hand every future frame to `sink`
    pub async fn add_sink(&self, sink: Arc<dyn FrameSink>) {
        tracing::debug!(sink = %sink.name(), "telemetry sink attached");
        self.inner.write().await.sinks.push(sink);
    }

    /// Publish a frame on its stream, creating the stream on first use
    ///
    /// Returns the number of live subscribers that received it. Frames
    /// without a payload are ignored.
    pub async fn publish(&self, frame: TelemetryFrame) -> usize {
        let Some(modality) = frame.modality() else {
            return 0;
        };
        let name = modality.stream_name(&frame.node_id);
        let timestamp = frame.payload.as_ref().map(|p| p.timestamp());

        let mut inner = self.inner.write().await;
        for sink in &inner.sinks {
            sink.accept(&name, &frame);
        }

        let buffer = self.buffer;
        let stream = inner.streams.entry(name.clone()).or_insert_with(|| {
            tracing::info!(stream = %name, "telemetry stream discovered");
            Stream::new(modality, &frame.node_id, buffer)
        });
        stream.frames += 1;
        stream.last_timestamp = timestamp;
        // no subscribers is not an error
        stream.tx.send(frame).unwrap_or(0)
    }

    /// Subscribe to a stream by name, creating it if nobody has published yet
    ///
    /// Returns `None` when the name is not `<Modality>_<nodeId>`.
    pub async fn subscribe(&self, name: &str) -> Option<broadcast::Receiver<TelemetryFrame>> {
        let (modality, node_id) = Modality::parse_stream_name(name)?;
        let mut inner = self.inner.write().await;
        let stream = inner
            .streams
            .entry(name.to_string())
            .or_insert_with(|| Stream::new(modality, node_id, self.buffer));
        Some(stream.tx.subscribe())
    }

    /// Every known stream, sorted by name
    pub async fn streams(&self) -> Vec<StreamInfo> {
        let inner = self.inner.read().await;
        let mut streams: Vec<StreamInfo> = inner
            .streams
            .iter()
            .map(|(name, stream)| stream.info(name))
            .collect();
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        streams
    }

    pub async fn stream(&self, name: &str) -> Option<StreamInfo> {
        let inner = self.inner.read().await;
        inner.streams.get(name).map(|s| s.info(name))
    }

    /// Publish every acknowledgment on its `CommandResponse_<nodeId>` stream
    #[must_use]
    pub fn mirror_responses(&self, mut responses: broadcast::Receiver<CommandResponse>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                match responses.recv().await {
                    Ok(response) => match response_frame(&response) {
                        Ok(frame) => {
                            hub.publish(frame).await;
                        }
                        Err(e) => tracing::debug!(error = %e, "response not mirrored"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "response mirror lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Drop every stream of a node, e.g. after its record is pruned
    pub async fn forget_node(&self, node_id: &str) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.streams.len();
        inner.streams.retain(|_, s| s.node_id != node_id);
        before - inner.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::TelemetryPayload;
    use crate::protocol::telemetry::{GsrSample, ThermalSummary};
    use crate::telemetry::sink::ChannelSink;

    fn gsr(node: &str, timestamp: f64) -> TelemetryFrame {
        TelemetryFrame::new(
            node,
            TelemetryPayload::Gsr(GsrSample {
                timestamp,
                conductance: 2.0,
                resistance: 500.0,
                quality: 1.0,
            }),
        )
    }

    #[tokio::test]
    async fn streams_are_discovered_on_publish() {
        let hub = TelemetryHub::new(8);
        hub.publish(gsr("a", 1.0)).await;
        hub.publish(gsr("a", 1.5)).await;
        hub.publish(TelemetryFrame::new(
            "b",
            TelemetryPayload::Thermal(ThermalSummary {
                timestamp: 2.0,
                width: 256,
                height: 192,
                min_temp: 20.0,
                max_temp: 36.5,
                avg_temp: 28.0,
                frame_number: 1,
            }),
        ))
        .await;

        let streams = hub.streams().await;
        let names: Vec<&str> = streams.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["GSR_a", "Thermal_b"]);
        assert_eq!(streams[0].frames, 2);
        assert_eq!(streams[0].last_timestamp, Some(1.5));
        assert_eq!(streams[0].channel_count, 3);
        assert_eq!(streams[1].nominal_rate, Some(25.0));
    }

    #[tokio::test]
    async fn subscriber_receives_frames() {
        let hub = TelemetryHub::new(8);
        let mut rx = hub.subscribe("GSR_a").await.unwrap();
        assert_eq!(hub.publish(gsr("a", 3.0)).await, 1);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.node_id, "a");
        assert!(hub.subscribe("Bogus_a").await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let hub = TelemetryHub::new(2);
        let mut rx = hub.subscribe("GSR_a").await.unwrap();
        for i in 0..5 {
            hub.publish(gsr("a", f64::from(i))).await;
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().payload.unwrap().timestamp(), 3.0);
    }

    #[tokio::test]
    async fn sinks_see_every_frame() {
        let hub = TelemetryHub::new(8);
        let (tx, mut rx) = mpsc::channel(8);
        hub.add_sink(Arc::new(ChannelSink::new("store", tx))).await;
        hub.publish(gsr("a", 1.0)).await;

        let (stream, frame) = rx.recv().await.unwrap();
        assert_eq!(stream, "GSR_a");
        assert_eq!(frame.node_id, "a");
    }

    #[tokio::test]
    async fn responses_are_mirrored_to_their_stream() {
        use crate::protocol::{CommandKind, ResponseStatus};

        let hub = TelemetryHub::new(8);
        let mut rx = hub.subscribe("CommandResponse_a").await.unwrap();
        let (tx, responses) = broadcast::channel(8);
        let _task = hub.mirror_responses(responses);

        tx.send(CommandResponse {
            seq: 4,
            kind: CommandKind::GetStatus,
            status: ResponseStatus::Success,
            node_id: "a".to_string(),
            timestamp: 10.0,
            message: String::new(),
            report: None,
        })
        .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.modality(), Some(Modality::CommandResponse));
    }

    #[tokio::test]
    async fn forget_node_drops_its_streams() {
        let hub = TelemetryHub::new(8);
        hub.publish(gsr("a", 1.0)).await;
        hub.publish(gsr("b", 1.0)).await;
        assert_eq!(hub.forget_node("a").await, 1);
        assert!(hub.stream("GSR_a").await.is_none());
        assert!(hub.stream("GSR_b").await.is_some());
    }
}
