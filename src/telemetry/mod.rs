//! Telemetry publish/subscribe
//!
//! Frames arrive over UDP, are published on a per-stream broadcast channel
//! named `<Modality>_<nodeId>`, and are handed to persistence sinks. The
//! receive path never waits on a subscriber or a sink.

pub mod hub;
pub mod sink;
pub mod udp;

pub use hub::{StreamInfo, TelemetryHub};
pub use sink::{ChannelSink, FrameSink, TracingSink};
pub use udp::{TelemetrySender, run_receiver};
