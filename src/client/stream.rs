//! Per-modality telemetry streaming on the node

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::capture::ModalitySource;
use crate::protocol::TelemetryFrame;
use crate::telemetry::TelemetrySender;

/// Node-local clock with an optional controller offset
#[derive(Debug, Clone)]
pub struct NodeClock {
    skew: f64,
    offset: watch::Receiver<Option<f64>>,
}

impl NodeClock {
    #[must_use]
    pub const fn new(skew: f64, offset: watch::Receiver<Option<f64>>) -> Self {
        Self { skew, offset }
    }

    /// Local time, seconds since epoch
    #[must_use]
    pub fn local(&self) -> f64 {
        crate::clock::now_seconds() + self.skew
    }

    /// Offset most recently reported by the controller
    #[must_use]
    pub fn offset(&self) -> Option<f64> {
        *self.offset.borrow()
    }

    /// Controller time if an offset is known
    #[must_use]
    pub fn corrected(&self, local: f64) -> Option<f64> {
        self.offset().map(|o| local - o)
    }

    /// Controller time, or local time before the first sync
    #[must_use]
    pub fn best(&self) -> f64 {
        let local = self.local();
        self.corrected(local).unwrap_or(local)
    }
}

/// Stream one modality at its nominal rate until aborted
pub fn spawn(
    node_id: String,
    mut source: Box<dyn ModalitySource>,
    clock: NodeClock,
    sender: Arc<TelemetrySender>,
) -> JoinHandle<()> {
    let period = Duration::from_secs_f64(1.0 / source.rate().max(0.1));
    tokio::spawn(async move {
        let modality = source.modality();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sent: u64 = 0;

        loop {
            ticker.tick().await;
            let frame = TelemetryFrame::new(node_id.clone(), source.next_payload(clock.best()));
            match sender.send(&frame).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::debug!(node_id = %node_id, %modality, error = %e, "telemetry send failed");
                }
            }
            if sent > 0 && sent % 1_000 == 0 {
                tracing::trace!(node_id = %node_id, %modality, sent, "telemetry streaming");
            }
        }
    })
}
