//! Wire protocol for the control and telemetry channels
//!
//! The control channel carries newline-delimited JSON envelopes over TCP.
//! The telemetry channel carries protobuf frames over UDP, one datagram per
//! frame.

pub mod command;
pub mod control;
pub mod telemetry;

pub use command::{
    Command, CommandKind, CommandParams, CommandResponse, DeviceStatus, MarkerKind,
    Registration, ResponseStatus,
};
pub use control::ControlMessage;
pub use telemetry::{Modality, TelemetryFrame, TelemetryPayload};
