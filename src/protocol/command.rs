//! Typed commands and responses shared by both wire encodings

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::CodecError;

/// Command kinds understood by capture nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Start,
    Stop,
    GetStatus,
    SyncTime,
    MarkEvent,
    StartStream,
    StopStream,
}

impl CommandKind {
    pub const ALL: [Self; 7] = [
        Self::Start,
        Self::Stop,
        Self::GetStatus,
        Self::SyncTime,
        Self::MarkEvent,
        Self::StartStream,
        Self::StopStream,
    ];

    /// Numeric code carried in the binary schema
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Start => 1,
            Self::Stop => 2,
            Self::GetStatus => 3,
            Self::SyncTime => 4,
            Self::MarkEvent => 5,
            Self::StartStream => 6,
            Self::StopStream => 7,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Start),
            2 => Some(Self::Stop),
            3 => Some(Self::GetStatus),
            4 => Some(Self::SyncTime),
            5 => Some(Self::MarkEvent),
            6 => Some(Self::StartStream),
            7 => Some(Self::StopStream),
            _ => None,
        }
    }

    /// Control-channel `kind` of the request
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Start => "start_recording",
            Self::Stop => "stop_recording",
            Self::GetStatus => "get_status",
            Self::SyncTime => "sync_time",
            Self::MarkEvent => "mark_event",
            Self::StartStream => "start_stream",
            Self::StopStream => "stop_stream",
        }
    }

    /// Control-channel `kind` of the acknowledgment
    #[must_use]
    pub const fn ack_name(self) -> &'static str {
        match self {
            Self::Start => "recording_started",
            Self::Stop => "recording_stopped",
            Self::GetStatus => "status_update",
            Self::SyncTime => "sync_time",
            Self::MarkEvent => "event_marked",
            Self::StartStream => "stream_started",
            Self::StopStream => "stream_stopped",
        }
    }

    #[must_use]
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.wire_name() == name)
    }

    #[must_use]
    pub fn from_ack_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.ack_name() == name)
    }

    /// Whether a duplicate delivery is harmless (safe to retry)
    #[must_use]
    pub const fn is_idempotent(self) -> bool {
        matches!(self, Self::GetStatus | Self::SyncTime)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::GetStatus => "GET_STATUS",
            Self::SyncTime => "SYNC_TIME",
            Self::MarkEvent => "MARK_EVENT",
            Self::StartStream => "START_STREAM",
            Self::StopStream => "STOP_STREAM",
        };
        f.write_str(s)
    }
}

/// What a sync marker denotes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    StartRecording,
    StopRecording,
    Periodic,
    Manual,
    Calibration,
}

impl MarkerKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartRecording => "start_recording",
            Self::StopRecording => "stop_recording",
            Self::Periodic => "periodic",
            Self::Manual => "manual",
            Self::Calibration => "calibration",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start_recording" => Some(Self::StartRecording),
            "stop_recording" => Some(Self::StopRecording),
            "periodic" => Some(Self::Periodic),
            "manual" => Some(Self::Manual),
            "calibration" => Some(Self::Calibration),
            _ => None,
        }
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind command parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandParams {
    /// Begin recording the listed modalities (empty = all the node supports)
    Start { modalities: Vec<String> },
    Stop,
    GetStatus,
    /// Clock exchange; carries the controller's last accepted offset if any
    SyncTime { last_offset: Option<f64> },
    MarkEvent {
        marker_id: String,
        marker_kind: MarkerKind,
        description: String,
    },
    StartStream { modality: String },
    StopStream { modality: String },
}

impl CommandParams {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Start { .. } => CommandKind::Start,
            Self::Stop => CommandKind::Stop,
            Self::GetStatus => CommandKind::GetStatus,
            Self::SyncTime { .. } => CommandKind::SyncTime,
            Self::MarkEvent { .. } => CommandKind::MarkEvent,
            Self::StartStream { .. } => CommandKind::StartStream,
            Self::StopStream { .. } => CommandKind::StopStream,
        }
    }
}

/// A command addressed to one node
///
/// `seq` is assigned by the connection manager when the command is queued.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub seq: u64,
    /// Target node id; empty means broadcast
    pub target: String,
    pub session_id: Option<String>,
    /// Controller clock, seconds since epoch
    pub origin_timestamp: f64,
    pub params: CommandParams,
}

impl Command {
    /// Build an unaddressed command stamped with the current time
    #[must_use]
    pub fn new(params: CommandParams) -> Self {
        Self {
            seq: 0,
            target: String::new(),
            session_id: None,
            origin_timestamp: clock::now_seconds(),
            params,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.params.kind()
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target.is_empty()
    }

    /// Check the command can be represented on either wire
    ///
    /// # Errors
    ///
    /// Returns `SchemaViolation` for non-finite timestamps or empty required fields
    pub fn validate(&self) -> Result<(), CodecError> {
        if !self.origin_timestamp.is_finite() {
            return Err(CodecError::SchemaViolation(format!(
                "non-finite origin timestamp on {} seq {}",
                self.kind(),
                self.seq
            )));
        }

        match &self.params {
            CommandParams::SyncTime {
                last_offset: Some(offset),
            } if !offset.is_finite() => Err(CodecError::SchemaViolation(
                "non-finite last offset".to_string(),
            )),
            CommandParams::MarkEvent { marker_id, .. } if marker_id.is_empty() => Err(
                CodecError::SchemaViolation("mark_event requires a marker id".to_string()),
            ),
            CommandParams::StartStream { modality } | CommandParams::StopStream { modality }
                if modality.is_empty() =>
            {
                Err(CodecError::SchemaViolation(format!(
                    "{} requires a modality",
                    self.kind()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Acknowledgment status reported by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Error,
    NotSupported,
    Busy,
}

impl ResponseStatus {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::Error => 1,
            Self::NotSupported => 2,
            Self::Busy => 3,
        }
    }

    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::Error),
            2 => Some(Self::NotSupported),
            3 => Some(Self::Busy),
            _ => None,
        }
    }
}

/// Node self-report carried by `status_update`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub recording: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub battery_percent: u8,
    pub storage_free_mb: u64,
    #[serde(default)]
    pub active_modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A node's reply to a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub seq: u64,
    pub kind: CommandKind,
    pub status: ResponseStatus,
    pub node_id: String,
    /// Responder's local clock, seconds since epoch
    pub timestamp: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<DeviceStatus>,
}

impl CommandResponse {
    /// Reply to `command` from `node_id`, stamped with the local clock
    #[must_use]
    pub fn reply(command: &Command, node_id: impl Into<String>, status: ResponseStatus) -> Self {
        Self {
            seq: command.seq,
            kind: command.kind(),
            status,
            node_id: node_id.into(),
            timestamp: clock::now_seconds(),
            message: String::new(),
            report: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_report(mut self, report: DeviceStatus) -> Self {
        self.report = Some(report);
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// # Errors
    ///
    /// Returns `SchemaViolation` when the timestamp is not finite
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.timestamp.is_finite() {
            Ok(())
        } else {
            Err(CodecError::SchemaViolation(format!(
                "non-finite timestamp on {} response seq {}",
                self.kind, self.seq
            )))
        }
    }
}

/// Handshake payload of `register_device`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub platform: String,
    /// Modality tags the node claims to support
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_names_are_bijective() {
        for kind in CommandKind::ALL {
            assert_eq!(CommandKind::from_code(kind.code()), Some(kind));
            assert_eq!(CommandKind::from_wire_name(kind.wire_name()), Some(kind));
            assert_eq!(CommandKind::from_ack_name(kind.ack_name()), Some(kind));
        }
        assert_eq!(CommandKind::from_code(0), None);
        assert_eq!(CommandKind::from_wire_name("reboot"), None);
    }

    #[test]
    fn only_status_and_sync_are_idempotent() {
        let retried: Vec<_> = CommandKind::ALL
            .into_iter()
            .filter(|k| k.is_idempotent())
            .collect();
        assert_eq!(retried, vec![CommandKind::GetStatus, CommandKind::SyncTime]);
    }

    #[test]
    fn marker_kind_parse() {
        assert_eq!(MarkerKind::parse("calibration"), Some(MarkerKind::Calibration));
        assert_eq!(MarkerKind::parse("flash"), None);
        assert_eq!(MarkerKind::Periodic.to_string(), "periodic");
    }

    #[test]
    fn validate_rejects_non_finite_timestamp() {
        let mut command = Command::new(CommandParams::Stop);
        command.origin_timestamp = f64::NAN;
        assert!(matches!(
            command.validate(),
            Err(CodecError::SchemaViolation(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_stream_modality() {
        let command = Command::new(CommandParams::StartStream {
            modality: String::new(),
        });
        assert!(command.validate().is_err());

        let command = Command::new(CommandParams::StartStream {
            modality: "GSR".to_string(),
        });
        assert!(command.validate().is_ok());
    }

    #[test]
    fn reply_echoes_seq_and_kind() {
        let mut command = Command::new(CommandParams::GetStatus).to("node-a");
        command.seq = 42;
        let response = CommandResponse::reply(&command, "node-a", ResponseStatus::Busy);
        assert_eq!(response.seq, 42);
        assert_eq!(response.kind, CommandKind::GetStatus);
        assert!(!response.is_success());
    }
}
