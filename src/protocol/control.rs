//! Control-channel encoding: one JSON envelope per line
//!
//! ```text
//! {"kind":"start_recording","deviceId":"node-a","timestamp":1700000000.25,"data":{"seq":3,...}}
//! ```
//!
//! The envelope always has exactly `kind`, `deviceId`, `timestamp` and
//! `data`. Unknown keys anywhere are ignored on decode. A `sync_time` message
//! is a reply when its `data` carries a `status`, otherwise a request.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::command::{
    Command, CommandKind, CommandParams, CommandResponse, DeviceStatus, MarkerKind,
    Registration, ResponseStatus,
};
use crate::error::CodecError;

const REGISTER_DEVICE: &str = "register_device";
const REGISTRATION_CONFIRMED: &str = "registration_confirmed";
const HEARTBEAT: &str = "heartbeat";
const HEARTBEAT_RESPONSE: &str = "heartbeat_response";

/// Every message that can cross the control channel
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Node → controller handshake
    RegisterDevice {
        timestamp: f64,
        registration: Registration,
    },
    /// Controller → node handshake acceptance
    RegistrationConfirmed {
        device_id: String,
        timestamp: f64,
        heartbeat_interval_secs: u64,
    },
    /// Liveness probe, sent by either side
    Heartbeat { device_id: String, timestamp: f64 },
    HeartbeatResponse { device_id: String, timestamp: f64 },
    /// Controller → node request
    Command(Command),
    /// Node → controller acknowledgment
    Response(CommandResponse),
}

impl ControlMessage {
    /// Wire `kind` string
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::RegisterDevice { .. } => REGISTER_DEVICE,
            Self::RegistrationConfirmed { .. } => REGISTRATION_CONFIRMED,
            Self::Heartbeat { .. } => HEARTBEAT,
            Self::HeartbeatResponse { .. } => HEARTBEAT_RESPONSE,
            Self::Command(c) => c.kind().wire_name(),
            Self::Response(r) => r.kind.ack_name(),
        }
    }

    /// Routing identity in the envelope
    #[must_use]
    pub fn device_id(&self) -> &str {
        match self {
            Self::RegisterDevice { registration, .. } => &registration.node_id,
            Self::RegistrationConfirmed { device_id, .. }
            | Self::Heartbeat { device_id, .. }
            | Self::HeartbeatResponse { device_id, .. } => device_id,
            Self::Command(c) => &c.target,
            Self::Response(r) => &r.node_id,
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> f64 {
        match self {
            Self::RegisterDevice { timestamp, .. }
            | Self::RegistrationConfirmed { timestamp, .. }
            | Self::Heartbeat { timestamp, .. }
            | Self::HeartbeatResponse { timestamp, .. } => *timestamp,
            Self::Command(c) => c.origin_timestamp,
            Self::Response(r) => r.timestamp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    kind: String,
    #[serde(rename = "deviceId", default)]
    device_id: String,
    timestamp: f64,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    capabilities: BTreeSet<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmData {
    #[serde(default)]
    heartbeat_interval: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandData {
    seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modalities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    marker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    marker_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modality: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseData {
    seq: u64,
    status: ResponseStatus,
    #[serde(default)]
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    report: Option<DeviceStatus>,
    /// Node receive/reply time of a clock exchange (mirrors `timestamp`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t1: Option<f64>,
}

fn check_timestamp(timestamp: f64, kind: &str) -> Result<(), CodecError> {
    if timestamp.is_finite() {
        Ok(())
    } else {
        Err(CodecError::SchemaViolation(format!(
            "non-finite timestamp on {kind}"
        )))
    }
}

fn to_value<T: Serialize>(data: &T) -> Result<Value, CodecError> {
    serde_json::to_value(data).map_err(|e| CodecError::SchemaViolation(e.to_string()))
}

fn from_value<T: for<'de> Deserialize<'de>>(kind: &str, data: Value) -> Result<T, CodecError> {
    // absent `data` decodes like an empty object
    let data = if data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| CodecError::Malformed(format!("{kind}: {e}")))
}

fn command_data(command: &Command) -> CommandData {
    let mut data = CommandData {
        seq: command.seq,
        session_id: command.session_id.clone(),
        ..CommandData::default()
    };

    match &command.params {
        CommandParams::Start { modalities } => data.modalities = Some(modalities.clone()),
        CommandParams::Stop | CommandParams::GetStatus => {}
        CommandParams::SyncTime { last_offset } => data.last_offset = *last_offset,
        CommandParams::MarkEvent {
            marker_id,
            marker_kind,
            description,
        } => {
            data.marker_id = Some(marker_id.clone());
            data.marker_kind = Some(marker_kind.as_str().to_string());
            data.description = Some(description.clone());
        }
        CommandParams::StartStream { modality } | CommandParams::StopStream { modality } => {
            data.modality = Some(modality.clone());
        }
    }

    data
}

fn command_params(kind: CommandKind, data: &mut CommandData) -> Result<CommandParams, CodecError> {
    let required = |field: Option<String>, name: &str| {
        field
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CodecError::Malformed(format!("{} missing {name}", kind.wire_name())))
    };

    Ok(match kind {
        CommandKind::Start => CommandParams::Start {
            modalities: data.modalities.take().unwrap_or_default(),
        },
        CommandKind::Stop => CommandParams::Stop,
        CommandKind::GetStatus => CommandParams::GetStatus,
        CommandKind::SyncTime => CommandParams::SyncTime {
            last_offset: data.last_offset,
        },
        CommandKind::MarkEvent => {
            let marker_id = required(data.marker_id.take(), "markerId")?;
            let raw_kind = required(data.marker_kind.take(), "markerKind")?;
            let marker_kind = MarkerKind::parse(&raw_kind).ok_or_else(|| {
                CodecError::Malformed(format!("unknown marker kind '{raw_kind}'"))
            })?;
            CommandParams::MarkEvent {
                marker_id,
                marker_kind,
                description: data.description.take().unwrap_or_default(),
            }
        }
        CommandKind::StartStream => CommandParams::StartStream {
            modality: required(data.modality.take(), "modality")?,
        },
        CommandKind::StopStream => CommandParams::StopStream {
            modality: required(data.modality.take(), "modality")?,
        },
    })
}

/// Encode a message as a single line of JSON (no trailing newline)
///
/// # Errors
///
/// Returns `SchemaViolation` if the message cannot be represented
pub fn encode(message: &ControlMessage) -> Result<String, CodecError> {
    let timestamp = message.timestamp();
    check_timestamp(timestamp, message.kind_name())?;

    let data = match message {
        ControlMessage::RegisterDevice { registration, .. } => {
            if registration.node_id.is_empty() {
                return Err(CodecError::SchemaViolation(
                    "register_device requires a device id".to_string(),
                ));
            }
            to_value(&RegisterData {
                display_name: registration.display_name.clone(),
                platform: registration.platform.clone(),
                capabilities: registration.capabilities.clone(),
            })?
        }
        ControlMessage::RegistrationConfirmed {
            heartbeat_interval_secs,
            ..
        } => to_value(&ConfirmData {
            heartbeat_interval: *heartbeat_interval_secs,
        })?,
        ControlMessage::Heartbeat { .. } | ControlMessage::HeartbeatResponse { .. } => {
            Value::Object(serde_json::Map::new())
        }
        ControlMessage::Command(command) => {
            command.validate()?;
            to_value(&command_data(command))?
        }
        ControlMessage::Response(response) => {
            response.validate()?;
            to_value(&ResponseData {
                seq: response.seq,
                status: response.status,
                message: response.message.clone(),
                report: response.report.clone(),
                t1: (response.kind == CommandKind::SyncTime).then_some(response.timestamp),
            })?
        }
    };

    let envelope = Envelope {
        kind: message.kind_name().to_string(),
        device_id: message.device_id().to_string(),
        timestamp,
        data,
    };

    serde_json::to_string(&envelope).map_err(|e| CodecError::SchemaViolation(e.to_string()))
}

/// Decode one line of the control channel
///
/// # Errors
///
/// Returns `Malformed` for invalid JSON or missing fields and `UnknownKind`
/// for a `kind` this build does not know
pub fn decode(line: &str) -> Result<ControlMessage, CodecError> {
    let envelope: Envelope =
        serde_json::from_str(line.trim()).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let Envelope {
        kind,
        device_id,
        timestamp,
        data,
    } = envelope;

    match kind.as_str() {
        REGISTER_DEVICE => {
            let data: RegisterData = from_value(&kind, data)?;
            Ok(ControlMessage::RegisterDevice {
                timestamp,
                registration: Registration {
                    node_id: device_id,
                    display_name: data.display_name,
                    platform: data.platform,
                    capabilities: data.capabilities,
                },
            })
        }
        REGISTRATION_CONFIRMED => {
            let data: ConfirmData = from_value(&kind, data)?;
            Ok(ControlMessage::RegistrationConfirmed {
                device_id,
                timestamp,
                heartbeat_interval_secs: data.heartbeat_interval,
            })
        }
        HEARTBEAT => Ok(ControlMessage::Heartbeat {
            device_id,
            timestamp,
        }),
        HEARTBEAT_RESPONSE => Ok(ControlMessage::HeartbeatResponse {
            device_id,
            timestamp,
        }),
        _ => decode_command_or_response(&kind, device_id, timestamp, data),
    }
}

fn decode_command_or_response(
    kind: &str,
    device_id: String,
    timestamp: f64,
    data: Value,
) -> Result<ControlMessage, CodecError> {
    let is_sync_reply = kind == CommandKind::SyncTime.ack_name() && data.get("status").is_some();

    if !is_sync_reply {
        if let Some(command_kind) = CommandKind::from_wire_name(kind) {
            let mut data: CommandData = from_value(kind, data)?;
            let params = command_params(command_kind, &mut data)?;
            return Ok(ControlMessage::Command(Command {
                seq: data.seq,
                target: device_id,
                session_id: data.session_id,
                origin_timestamp: timestamp,
                params,
            }));
        }
    }

    if let Some(command_kind) = CommandKind::from_ack_name(kind) {
        let data: ResponseData = from_value(kind, data)?;
        return Ok(ControlMessage::Response(CommandResponse {
            seq: data.seq,
            kind: command_kind,
            status: data.status,
            node_id: device_id,
            timestamp,
            message: data.message,
            report: data.report,
        }));
    }

    Err(CodecError::UnknownKind(kind.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(params: CommandParams) -> Command {
        Command {
            seq: 7,
            target: "node-a".to_string(),
            session_id: Some("session_20240101_120000".to_string()),
            origin_timestamp: 1_700_000_000.125,
            params,
        }
    }

    fn round_trip(message: &ControlMessage) -> ControlMessage {
        let line = encode(message).unwrap();
        assert!(!line.contains('\n'));
        let decoded = decode(&line).unwrap();
        // re-encoding the decoded value is stable
        assert_eq!(encode(&decoded).unwrap(), line);
        decoded
    }

    #[test]
    fn envelope_has_exactly_four_fields() {
        let line = encode(&ControlMessage::Heartbeat {
            device_id: "node-a".to_string(),
            timestamp: 12.5,
        })
        .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        let keys: BTreeSet<_> = value.as_object().unwrap().keys().cloned().collect();
        let expected: BTreeSet<_> = ["kind", "deviceId", "timestamp", "data"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn commands_round_trip() {
        let all = [
            CommandParams::Start {
                modalities: vec!["GSR".to_string(), "Thermal".to_string()],
            },
            CommandParams::Stop,
            CommandParams::GetStatus,
            CommandParams::SyncTime {
                last_offset: Some(-0.010),
            },
            CommandParams::SyncTime { last_offset: None },
            CommandParams::MarkEvent {
                marker_id: "m-1".to_string(),
                marker_kind: MarkerKind::Calibration,
                description: "flash".to_string(),
            },
            CommandParams::StartStream {
                modality: "GSR".to_string(),
            },
            CommandParams::StopStream {
                modality: "Thermal".to_string(),
            },
        ];

        for params in all {
            let original = ControlMessage::Command(command(params));
            assert_eq!(round_trip(&original), original);
        }
    }

    #[test]
    fn responses_round_trip() {
        let status = CommandResponse {
            seq: 3,
            kind: CommandKind::GetStatus,
            status: ResponseStatus::Success,
            node_id: "node-a".to_string(),
            timestamp: 1_700_000_001.5,
            message: "ok".to_string(),
            report: Some(DeviceStatus {
                recording: true,
                session_id: Some("s1".to_string()),
                battery_percent: 81,
                storage_free_mb: 20_480,
                active_modalities: vec!["GSR".to_string()],
                last_error: None,
            }),
        };
        let original = ControlMessage::Response(status);
        assert_eq!(round_trip(&original), original);

        let busy = ControlMessage::Response(CommandResponse {
            seq: 9,
            kind: CommandKind::Start,
            status: ResponseStatus::Busy,
            node_id: "node-b".to_string(),
            timestamp: 5.0,
            message: "already recording".to_string(),
            report: None,
        });
        assert_eq!(round_trip(&busy), busy);
    }

    #[test]
    fn sync_time_direction_follows_status() {
        let request = ControlMessage::Command(command(CommandParams::SyncTime {
            last_offset: None,
        }));
        assert!(matches!(round_trip(&request), ControlMessage::Command(_)));

        let reply = ControlMessage::Response(CommandResponse {
            seq: 7,
            kind: CommandKind::SyncTime,
            status: ResponseStatus::Success,
            node_id: "node-a".to_string(),
            timestamp: 100.050,
            message: String::new(),
            report: None,
        });
        let line = encode(&reply).unwrap();
        assert!(line.contains("\"t1\":100.05"));
        assert!(matches!(decode(&line).unwrap(), ControlMessage::Response(_)));
    }

    #[test]
    fn handshake_round_trip() {
        let register = ControlMessage::RegisterDevice {
            timestamp: 1.0,
            registration: Registration {
                node_id: "phone-1".to_string(),
                display_name: Some("Pixel".to_string()),
                platform: "android".to_string(),
                capabilities: ["GSR", "Thermal"].into_iter().map(String::from).collect(),
            },
        };
        assert_eq!(round_trip(&register), register);

        let confirm = ControlMessage::RegistrationConfirmed {
            device_id: "phone-1".to_string(),
            timestamp: 2.0,
            heartbeat_interval_secs: 30,
        };
        assert_eq!(round_trip(&confirm), confirm);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let line = r#"{"kind":"get_status","deviceId":"n1","timestamp":3.5,
            "data":{"seq":11,"future":{"nested":true}},"extra":1}"#;
        let ControlMessage::Command(cmd) = decode(line).unwrap() else {
            panic!("expected command");
        };
        assert_eq!(cmd.seq, 11);
        assert_eq!(cmd.params, CommandParams::GetStatus);
    }

    #[test]
    fn unknown_kind_is_reported() {
        let line = r#"{"kind":"reboot","deviceId":"n1","timestamp":1.0,"data":{}}"#;
        assert_eq!(
            decode(line),
            Err(CodecError::UnknownKind("reboot".to_string()))
        );
    }

    #[test]
    fn malformed_input_is_reported() {
        assert!(matches!(decode("not json"), Err(CodecError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"kind":"heartbeat"}"#),
            Err(CodecError::Malformed(_))
        ));
        let missing_marker = r#"{"kind":"mark_event","deviceId":"n","timestamp":1.0,"data":{"seq":1}}"#;
        assert!(matches!(
            decode(missing_marker),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn non_finite_timestamp_is_schema_violation() {
        let message = ControlMessage::Heartbeat {
            device_id: "n".to_string(),
            timestamp: f64::INFINITY,
        };
        assert!(matches!(
            encode(&message),
            Err(CodecError::SchemaViolation(_))
        ));
    }
}
