//! Telemetry-channel encoding: versioned protobuf frames
//!
//! Every UDP datagram is one [`TelemetryFrame`]. Field numbers are fixed;
//! new fields get new numbers so older consumers skip them. Timestamps inside
//! payloads are in the sender's corrected (controller) clock.

use std::fmt;

use prost::Message;
use serde::Serialize;

use super::command::{
    Command, CommandKind, CommandParams, CommandResponse, DeviceStatus, MarkerKind,
    ResponseStatus,
};
use crate::error::CodecError;

/// Current frame schema version
pub const SCHEMA_VERSION: u32 = 1;

/// Outer frame: version, sender, one payload per modality
#[derive(Clone, PartialEq, Message)]
pub struct TelemetryFrame {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub node_id: String,
    #[prost(oneof = "TelemetryPayload", tags = "3, 4, 5, 6")]
    pub payload: Option<TelemetryPayload>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum TelemetryPayload {
    #[prost(message, tag = "3")]
    Gsr(GsrSample),
    #[prost(message, tag = "4")]
    Thermal(ThermalSummary),
    #[prost(message, tag = "5")]
    Response(ResponseFrame),
    #[prost(message, tag = "6")]
    Command(CommandFrame),
}

/// Skin conductance sample (three channels, ~128 Hz)
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct GsrSample {
    #[prost(double, tag = "1")]
    pub timestamp: f64,
    /// Microsiemens
    #[prost(double, tag = "2")]
    pub conductance: f64,
    /// Kiloohms
    #[prost(double, tag = "3")]
    pub resistance: f64,
    /// Signal quality, 0.0 to 1.0
    #[prost(double, tag = "4")]
    pub quality: f64,
}

/// Per-frame thermal statistics (six fields, ~25 Hz)
#[derive(Clone, PartialEq, Message, Serialize)]
pub struct ThermalSummary {
    #[prost(double, tag = "1")]
    pub timestamp: f64,
    #[prost(uint32, tag = "2")]
    pub width: u32,
    #[prost(uint32, tag = "3")]
    pub height: u32,
    #[prost(double, tag = "4")]
    pub min_temp: f64,
    #[prost(double, tag = "5")]
    pub max_temp: f64,
    #[prost(double, tag = "6")]
    pub avg_temp: f64,
    #[prost(uint64, tag = "7")]
    pub frame_number: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct StatusReport {
    #[prost(bool, tag = "1")]
    pub recording: bool,
    #[prost(string, optional, tag = "2")]
    pub session_id: Option<String>,
    #[prost(uint32, tag = "3")]
    pub battery_percent: u32,
    #[prost(uint64, tag = "4")]
    pub storage_free_mb: u64,
    #[prost(string, repeated, tag = "5")]
    pub active_modalities: Vec<String>,
    #[prost(string, optional, tag = "6")]
    pub last_error: Option<String>,
}

/// Acknowledgment published on the `CommandResponse_<node>` stream
#[derive(Clone, PartialEq, Message)]
pub struct ResponseFrame {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(uint32, tag = "2")]
    pub kind: u32,
    #[prost(uint32, tag = "3")]
    pub status: u32,
    #[prost(double, tag = "4")]
    pub timestamp: f64,
    #[prost(string, tag = "5")]
    pub message: String,
    #[prost(message, optional, tag = "6")]
    pub report: Option<StatusReport>,
}

/// Command published on the `Command_<node>` stream
#[derive(Clone, PartialEq, Message)]
pub struct CommandFrame {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(uint32, tag = "2")]
    pub kind: u32,
    #[prost(string, optional, tag = "3")]
    pub session_id: Option<String>,
    #[prost(double, tag = "4")]
    pub origin_timestamp: f64,
    #[prost(string, repeated, tag = "5")]
    pub modalities: Vec<String>,
    #[prost(double, optional, tag = "6")]
    pub last_offset: Option<f64>,
    #[prost(string, optional, tag = "7")]
    pub marker_id: Option<String>,
    #[prost(string, optional, tag = "8")]
    pub marker_kind: Option<String>,
    #[prost(string, optional, tag = "9")]
    pub description: Option<String>,
    #[prost(string, optional, tag = "10")]
    pub modality: Option<String>,
}

/// Telemetry stream families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Modality {
    Gsr,
    Thermal,
    CommandResponse,
    Command,
}

impl Modality {
    pub const ALL: [Self; 4] = [
        Self::Gsr,
        Self::Thermal,
        Self::CommandResponse,
        Self::Command,
    ];

    /// Stream name prefix, also the capability tag for sensor modalities
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Gsr => "GSR",
            Self::Thermal => "Thermal",
            Self::CommandResponse => "CommandResponse",
            Self::Command => "Command",
        }
    }

    /// Sample rate in Hz; `None` for irregular streams
    #[must_use]
    pub const fn nominal_rate(self) -> Option<f64> {
        match self {
            Self::Gsr => Some(128.0),
            Self::Thermal => Some(25.0),
            Self::CommandResponse | Self::Command => None,
        }
    }

    /// Numeric channels per sample
    #[must_use]
    pub const fn channel_count(self) -> usize {
        match self {
            Self::Gsr => 3,
            Self::Thermal => 6,
            Self::CommandResponse | Self::Command => 1,
        }
    }

    /// Sensor modality named by a capability tag
    #[must_use]
    pub fn from_capability(tag: &str) -> Option<Self> {
        match tag {
            t if t.eq_ignore_ascii_case("GSR") => Some(Self::Gsr),
            t if t.eq_ignore_ascii_case("Thermal") => Some(Self::Thermal),
            _ => None,
        }
    }

    #[must_use]
    pub fn stream_name(self, node_id: &str) -> String {
        format!("{}_{node_id}", self.prefix())
    }

    /// Split `<Modality>_<nodeId>` into its parts
    #[must_use]
    pub fn parse_stream_name(name: &str) -> Option<(Self, &str)> {
        // longest prefix first so `CommandResponse_` is not read as `Command_`
        [
            Self::CommandResponse,
            Self::Command,
            Self::Thermal,
            Self::Gsr,
        ]
        .into_iter()
        .find_map(|m| {
            name.strip_prefix(m.prefix())
                .and_then(|rest| rest.strip_prefix('_'))
                .filter(|id| !id.is_empty())
                .map(|id| (m, id))
        })
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl TelemetryPayload {
    #[must_use]
    pub const fn modality(&self) -> Modality {
        match self {
            Self::Gsr(_) => Modality::Gsr,
            Self::Thermal(_) => Modality::Thermal,
            Self::Response(_) => Modality::CommandResponse,
            Self::Command(_) => Modality::Command,
        }
    }

    /// Embedded timestamp in the sender's corrected clock
    #[must_use]
    pub const fn timestamp(&self) -> f64 {
        match self {
            Self::Gsr(s) => s.timestamp,
            Self::Thermal(t) => t.timestamp,
            Self::Response(r) => r.timestamp,
            Self::Command(c) => c.origin_timestamp,
        }
    }
}

impl TelemetryFrame {
    #[must_use]
    pub fn new(node_id: impl Into<String>, payload: TelemetryPayload) -> Self {
        Self {
            version: SCHEMA_VERSION,
            node_id: node_id.into(),
            payload: Some(payload),
        }
    }

    #[must_use]
    pub fn modality(&self) -> Option<Modality> {
        self.payload.as_ref().map(TelemetryPayload::modality)
    }

    #[must_use]
    pub fn stream_name(&self) -> Option<String> {
        self.modality().map(|m| m.stream_name(&self.node_id))
    }
}

/// Encode a frame into a datagram body
///
/// # Errors
///
/// Returns `SchemaViolation` for a missing payload, zero version or
/// non-finite timestamp
pub fn encode(frame: &TelemetryFrame) -> Result<Vec<u8>, CodecError> {
    if frame.version == 0 {
        return Err(CodecError::SchemaViolation("frame version is 0".to_string()));
    }
    let Some(payload) = &frame.payload else {
        return Err(CodecError::SchemaViolation("frame has no payload".to_string()));
    };
    if !payload.timestamp().is_finite() {
        return Err(CodecError::SchemaViolation(format!(
            "non-finite timestamp in {} frame",
            payload.modality()
        )));
    }

    Ok(frame.encode_to_vec())
}

/// Decode a datagram body
///
/// Truncated or garbled input yields `PartialDecode`; a payload tag this
/// build does not know yields `UnknownKind`.
///
/// # Errors
///
/// Returns `PartialDecode`, `Malformed` or `UnknownKind`
pub fn decode(bytes: &[u8]) -> Result<TelemetryFrame, CodecError> {
    let frame = TelemetryFrame::decode(bytes)
        .map_err(|e| CodecError::PartialDecode(format!("{} bytes: {e}", bytes.len())))?;

    if frame.version == 0 {
        return Err(CodecError::Malformed("missing frame version".to_string()));
    }
    if frame.payload.is_none() {
        return Err(CodecError::UnknownKind(format!(
            "frame v{} from '{}' has no known payload",
            frame.version, frame.node_id
        )));
    }

    Ok(frame)
}

impl From<&DeviceStatus> for StatusReport {
    fn from(status: &DeviceStatus) -> Self {
        Self {
            recording: status.recording,
            session_id: status.session_id.clone(),
            battery_percent: u32::from(status.battery_percent),
            storage_free_mb: status.storage_free_mb,
            active_modalities: status.active_modalities.clone(),
            last_error: status.last_error.clone(),
        }
    }
}

impl From<StatusReport> for DeviceStatus {
    fn from(report: StatusReport) -> Self {
        Self {
            recording: report.recording,
            session_id: report.session_id,
            battery_percent: u8::try_from(report.battery_percent.min(100)).unwrap_or(100),
            storage_free_mb: report.storage_free_mb,
            active_modalities: report.active_modalities,
            last_error: report.last_error,
        }
    }
}

/// Wrap a response for the `CommandResponse_<node>` stream
///
/// # Errors
///
/// Returns `SchemaViolation` if the response cannot be represented
pub fn response_frame(response: &CommandResponse) -> Result<TelemetryFrame, CodecError> {
    response.validate()?;
    Ok(TelemetryFrame::new(
        response.node_id.clone(),
        TelemetryPayload::Response(ResponseFrame {
            seq: response.seq,
            kind: response.kind.code(),
            status: response.status.code(),
            timestamp: response.timestamp,
            message: response.message.clone(),
            report: response.report.as_ref().map(StatusReport::from),
        }),
    ))
}

/// Unwrap a response frame
///
/// # Errors
///
/// Returns `UnknownKind` for a non-response payload or unknown kind code
pub fn response_from_frame(frame: TelemetryFrame) -> Result<CommandResponse, CodecError> {
    let Some(TelemetryPayload::Response(r)) = frame.payload else {
        return Err(CodecError::UnknownKind(
            "expected a command response frame".to_string(),
        ));
    };
    let kind = CommandKind::from_code(r.kind)
        .ok_or_else(|| CodecError::UnknownKind(format!("command kind code {}", r.kind)))?;
    let status = ResponseStatus::from_code(r.status)
        .ok_or_else(|| CodecError::Malformed(format!("response status code {}", r.status)))?;

    Ok(CommandResponse {
        seq: r.seq,
        kind,
        status,
        node_id: frame.node_id,
        timestamp: r.timestamp,
        message: r.message,
        report: r.report.map(DeviceStatus::from),
    })
}

/// Wrap a command for the `Command_<node>` stream
///
/// # Errors
///
/// Returns `SchemaViolation` if the command cannot be represented
pub fn command_frame(command: &Command) -> Result<TelemetryFrame, CodecError> {
    command.validate()?;

    let mut body = CommandFrame {
        seq: command.seq,
        kind: command.kind().code(),
        session_id: command.session_id.clone(),
        origin_timestamp: command.origin_timestamp,
        ..CommandFrame::default()
    };
    match &command.params {
        CommandParams::Start { modalities } => body.modalities.clone_from(modalities),
        CommandParams::Stop | CommandParams::GetStatus => {}
        CommandParams::SyncTime { last_offset } => body.last_offset = *last_offset,
        CommandParams::MarkEvent {
            marker_id,
            marker_kind,
            description,
        } => {
            body.marker_id = Some(marker_id.clone());
            body.marker_kind = Some(marker_kind.as_str().to_string());
            body.description = Some(description.clone());
        }
        CommandParams::StartStream { modality } | CommandParams::StopStream { modality } => {
            body.modality = Some(modality.clone());
        }
    }

    Ok(TelemetryFrame::new(
        command.target.clone(),
        TelemetryPayload::Command(body),
    ))
}

/// Unwrap a command frame
///
/// # Errors
///
/// Returns `UnknownKind` for a non-command payload or unknown kind code and
/// `Malformed` when a required field is absent
pub fn command_from_frame(frame: TelemetryFrame) -> Result<Command, CodecError> {
    let Some(TelemetryPayload::Command(c)) = frame.payload else {
        return Err(CodecError::UnknownKind("expected a command frame".to_string()));
    };
    let kind = CommandKind::from_code(c.kind)
        .ok_or_else(|| CodecError::UnknownKind(format!("command kind code {}", c.kind)))?;
    let missing = |field: &str| CodecError::Malformed(format!("{kind} frame missing {field}"));

    let params = match kind {
        CommandKind::Start => CommandParams::Start {
            modalities: c.modalities,
        },
        CommandKind::Stop => CommandParams::Stop,
        CommandKind::GetStatus => CommandParams::GetStatus,
        CommandKind::SyncTime => CommandParams::SyncTime {
            last_offset: c.last_offset,
        },
        CommandKind::MarkEvent => {
            let marker_id = c.marker_id.ok_or_else(|| missing("marker_id"))?;
            let raw = c.marker_kind.ok_or_else(|| missing("marker_kind"))?;
            let marker_kind = MarkerKind::parse(&raw)
                .ok_or_else(|| CodecError::Malformed(format!("unknown marker kind '{raw}'")))?;
            CommandParams::MarkEvent {
                marker_id,
                marker_kind,
                description: c.description.unwrap_or_default(),
            }
        }
        CommandKind::StartStream => CommandParams::StartStream {
            modality: c.modality.ok_or_else(|| missing("modality"))?,
        },
        CommandKind::StopStream => CommandParams::StopStream {
            modality: c.modality.ok_or_else(|| missing("modality"))?,
        },
    };

    Ok(Command {
        seq: c.seq,
        target: frame.node_id,
        session_id: c.session_id,
        origin_timestamp: c.origin_timestamp,
        params,
    })
}
