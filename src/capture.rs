//! Acquisition collaborators on the capture-node side
//!
//! [`CaptureBackend`] is the opaque "start/stop capture for modality X"
//! layer a session drives. [`ModalitySource`] produces the telemetry payloads
//! a node streams while a modality is active. The simulated sources stand in
//! for real sensor SDKs.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::telemetry::{GsrSample, ThermalSummary};
use crate::protocol::{Modality, TelemetryPayload};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("modality not supported: {0}")]
    Unsupported(String),

    #[error("device error: {0}")]
    Device(String),
}

/// Sensor or camera acquisition layer
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Begin capture for one modality
    async fn start_capture(&self, modality: &str, session_id: Option<&str>) -> Result<(), CaptureError>;

    /// End capture for one modality
    async fn stop_capture(&self, modality: &str) -> Result<(), CaptureError>;
}

/// Backend that only logs; used by simulated nodes
#[derive(Debug, Default)]
pub struct LoggingCapture;

#[async_trait]
impl CaptureBackend for LoggingCapture {
    async fn start_capture(&self, modality: &str, session_id: Option<&str>) -> Result<(), CaptureError> {
        tracing::info!(modality = %modality, session_id = ?session_id, "capture started");
        Ok(())
    }

    async fn stop_capture(&self, modality: &str) -> Result<(), CaptureError> {
        tracing::info!(modality = %modality, "capture stopped");
        Ok(())
    }
}

/// Produces one telemetry payload per tick
pub trait ModalitySource: Send {
    fn modality(&self) -> Modality;

    /// Sampling rate in Hz
    fn rate(&self) -> f64 {
        self.modality().nominal_rate().unwrap_or(1.0)
    }

    /// Next sample, stamped with `timestamp` (controller clock)
    fn next_payload(&mut self, timestamp: f64) -> TelemetryPayload;
}

/// Build the simulated source for a modality, if one exists
#[must_use]
pub fn simulated_source(modality: Modality) -> Option<Box<dyn ModalitySource>> {
    match modality {
        Modality::Gsr => Some(Box::new(SimulatedGsr::new())),
        Modality::Thermal => Some(Box::new(SimulatedThermal::new())),
        Modality::CommandResponse | Modality::Command => None,
    }
}

/// Skin conductance random walk around a resting baseline
pub struct SimulatedGsr {
    rng: StdRng,
    conductance: f64,
}

impl SimulatedGsr {
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            conductance: 5.0,
        }
    }
}

impl Default for SimulatedGsr {
    fn default() -> Self {
        Self::new()
    }
}

impl ModalitySource for SimulatedGsr {
    fn modality(&self) -> Modality {
        Modality::Gsr
    }

    fn next_payload(&mut self, timestamp: f64) -> TelemetryPayload {
        self.conductance = (self.conductance + self.rng.gen_range(-0.05..0.05)).clamp(1.0, 20.0);
        TelemetryPayload::Gsr(GsrSample {
            timestamp,
            conductance: self.conductance,
            // 1 / µS = MΩ
            resistance: 1000.0 / self.conductance,
            quality: self.rng.gen_range(0.85..1.0),
        })
    }
}

/// Thermal frame statistics for a 256x192 sensor
pub struct SimulatedThermal {
    rng: StdRng,
    frame_number: u64,
}

impl SimulatedThermal {
    pub const WIDTH: u32 = 256;
    pub const HEIGHT: u32 = 192;

    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    const fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            frame_number: 0,
        }
    }
}

impl Default for SimulatedThermal {
    fn default() -> Self {
        Self::new()
    }
}

impl ModalitySource for SimulatedThermal {
    fn modality(&self) -> Modality {
        Modality::Thermal
    }

    fn next_payload(&mut self, timestamp: f64) -> TelemetryPayload {
        self.frame_number += 1;
        let min_temp = self.rng.gen_range(19.0..23.0);
        let max_temp = self.rng.gen_range(33.5..37.5);
        let avg_temp = self.rng.gen_range(min_temp..max_temp);
        TelemetryPayload::Thermal(ThermalSummary {
            timestamp,
            width: Self::WIDTH,
            height: Self::HEIGHT,
            min_temp,
            max_temp,
            avg_temp,
            frame_number: self.frame_number,
        })
    }
}
