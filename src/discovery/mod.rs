//! Service discovery using mDNS/DNS-SD
//!
//! The controller advertises its control and telemetry ports so capture
//! nodes on the local network can find it without manual configuration

pub mod mdns;

pub use mdns::{ControllerEndpoint, MdnsAdvertiser, browse};
