//! Capture Sync - multi-device capture coordination
//!
//! A controller that keeps a fleet of capture nodes (wearable sensors,
//! thermal cameras, phones) recording in lockstep:
//! - Node registration, heartbeats and liveness over a JSON control channel
//! - Command dispatch with correlation, deadlines and per-node outcomes
//! - Per-node clock offset estimation
//! - Recording sessions with confirmation tracking
//! - Binary telemetry fan-out to subscribers
//! - Sync markers stamped on every node's timeline
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Interfaces                        │
//! │     HTTP API  │  mDNS  │  CLI  │  simulated nodes   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Coordinator                         │
//! │  Sessions  │  Markers  │  Dispatcher  │  Telemetry  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Connection manager                     │
//! │  TCP control (JSON lines)  │  UDP telemetry (proto) │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod client;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod markers;
pub mod nodes;
pub mod protocol;
pub mod session;
pub mod telemetry;

pub use clock::{ClockOffsetEstimator, SyncQuality};
pub use config::Config;
pub use coordinator::{Coordinator, StartReport, StopReport};
pub use daemon::Daemon;
pub use dispatcher::{BroadcastReport, Dispatcher, Outcome};
pub use error::{Error, Result, SessionError};
pub use markers::{MarkerEmitter, SyncMarkerRecord};
pub use nodes::{ConnectionManager, ConnectionState, NodeSnapshot};
pub use session::{Session, SessionHandle, SessionPhase, SessionStatus};
pub use telemetry::TelemetryHub;
