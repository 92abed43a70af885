//! Capture node connections
//!
//! Nodes connect over the control channel, register their capabilities,
//! and receive commands from the controller. The registry is the only
//! structure that tracks their connection state.

pub mod connection;
pub mod manager;
pub mod registry;
pub mod types;

pub use manager::{ConnectionManager, ConnectionSettings, InFlight};
pub use registry::{NodeRegistry, SharedNodeRegistry};
pub use types::{ConnectionState, LivenessReport, NodeEvent, NodeLink, NodeSnapshot};
