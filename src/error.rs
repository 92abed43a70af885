//! Error types for the capture coordination subsystem

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the controller or a capture node runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure (refused, reset, malformed handshake)
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed or unknown message
    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    /// Node registration rejected
    #[error("registration error: {0}")]
    Register(#[from] RegisterError),

    /// Command could not be handed to a node
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Session state machine rejected a request
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// mDNS advertisement error
    #[error("discovery error: {0}")]
    Discovery(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures from either wire encoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The value cannot be represented on the wire (e.g. non-finite timestamp)
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// The bytes are not a well-formed message
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The message kind is not one this build understands
    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    /// Binary input was truncated or carried undecodable trailing bytes
    #[error("partial decode: {0}")]
    PartialDecode(String),
}

/// Registration handshake rejections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// A live node already holds this identifier
    #[error("node id already registered: {0}")]
    DuplicateId(String),

    /// The handshake payload is unusable
    #[error("malformed handshake: {0}")]
    Malformed(String),
}

/// Failures handing a command to a node connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// Node unknown or not in a reachable state
    #[error("node not connected: {0}")]
    NotConnected(String),

    /// The connection's outbound queue is closed
    #[error("write failed for node {0}")]
    WriteFailed(String),
}

/// Session state machine rejections
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Another session is still open
    #[error("session {0} is still recording")]
    AlreadyRecording(String),

    /// The operation needs an open session
    #[error("no active session")]
    NoActiveSession,

    /// The session task has stopped
    #[error("session manager is not running")]
    Closed,
}
