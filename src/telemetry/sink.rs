//! Persistence hand-off for telemetry frames
//!
//! Sinks receive every published frame without knowing how (or whether) it
//! is stored. `accept` must not block.

use tokio::sync::mpsc;

use crate::protocol::TelemetryFrame;

pub trait FrameSink: Send + Sync {
    /// Sink name for logging
    fn name(&self) -> &str;

    /// Take a frame; a full sink drops it
    fn accept(&self, stream: &str, frame: &TelemetryFrame);
}

/// Logs each frame at trace level
#[derive(Debug, Default)]
pub struct TracingSink;

impl FrameSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn accept(&self, stream: &str, frame: &TelemetryFrame) {
        if let Some(payload) = &frame.payload {
            tracing::trace!(stream = %stream, timestamp = payload.timestamp(), "telemetry frame");
        }
    }
}

/// Forwards frames to a bounded channel, e.g. a file writer task
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<(String, TelemetryFrame)>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<(String, TelemetryFrame)>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }
}

impl FrameSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, stream: &str, frame: &TelemetryFrame) {
        if let Err(e) = self.tx.try_send((stream.to_string(), frame.clone())) {
            tracing::trace!(sink = %self.name, stream = %stream, error = %e, "sink dropped frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TelemetryPayload;
    use crate::protocol::telemetry::GsrSample;

    fn frame() -> TelemetryFrame {
        TelemetryFrame::new(
            "a",
            TelemetryPayload::Gsr(GsrSample {
                timestamp: 1.0,
                conductance: 2.0,
                resistance: 500.0,
                quality: 1.0,
            }),
        )
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ChannelSink::new("file", tx);
        sink.accept("GSR_a", &frame());
        sink.accept("GSR_a", &frame());

        assert_eq!(rx.try_recv().unwrap().0, "GSR_a");
        assert!(rx.try_recv().is_err());
    }
}
