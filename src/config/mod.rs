//! Configuration management for the capture controller

pub mod file;

use std::time::Duration;

use crate::{Error, Result};

use self::file::CaptureSyncConfigFile;

/// Default TCP port of the control channel
pub const DEFAULT_CONTROL_PORT: u16 = 8080;
/// Default UDP port of the telemetry channel
pub const DEFAULT_TELEMETRY_PORT: u16 = 8081;
/// Default HTTP port of the operator API
pub const DEFAULT_API_PORT: u16 = 18800;

/// Controller configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Address all listeners bind to
    pub bind: String,

    /// TCP control channel port (`CAPTURE_SYNC_CONTROL_PORT`)
    pub control_port: u16,

    /// UDP telemetry port (`CAPTURE_SYNC_TELEMETRY_PORT`)
    pub telemetry_port: u16,

    /// HTTP operator API port (`CAPTURE_SYNC_API_PORT`)
    pub api_port: u16,

    /// Liveness tick period; a node is LOST after twice this
    pub heartbeat_interval_secs: u64,

    /// Ticks a LOST record stays visible before pruning
    pub lost_retention_ticks: u32,

    /// Default per-command deadline
    pub command_timeout_ms: u64,

    /// Deadline for START acknowledgments
    pub start_timeout_ms: u64,

    /// Extra attempts for GET_STATUS and SYNC_TIME on timeout
    pub idempotent_retries: u32,

    /// Clock samples with a slower round trip are discarded
    pub sync_latency_ceiling_ms: u64,

    /// Period between clock resynchronizations
    pub resync_interval_secs: u64,

    /// Malformed messages tolerated per window before a connection is closed
    pub malformed_burst_limit: usize,
    pub malformed_burst_window_secs: u64,

    /// Frames buffered per telemetry stream
    pub telemetry_buffer: usize,

    /// Advertise over mDNS
    pub advertise: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            telemetry_port: DEFAULT_TELEMETRY_PORT,
            api_port: DEFAULT_API_PORT,
            heartbeat_interval_secs: 30,
            lost_retention_ticks: 3,
            command_timeout_ms: 5_000,
            start_timeout_ms: 2_000,
            idempotent_retries: 2,
            sync_latency_ceiling_ms: 500,
            resync_interval_secs: 30,
            malformed_burst_limit: 10,
            malformed_burst_window_secs: 5,
            telemetry_buffer: 256,
            advertise: true,
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting values are unusable
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Assemble configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resulting values are unusable
    pub fn from_sources<F>(fc: CaptureSyncConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| env(key).and_then(|s| s.trim().parse::<u64>().ok());
        let port = |key: &str| env(key).and_then(|s| s.trim().parse::<u16>().ok());

        let config = Self {
            bind: env("CAPTURE_SYNC_BIND")
                .or(fc.network.bind)
                .unwrap_or(defaults.bind),
            control_port: port("CAPTURE_SYNC_CONTROL_PORT")
                .or(fc.network.control_port)
                .unwrap_or(defaults.control_port),
            telemetry_port: port("CAPTURE_SYNC_TELEMETRY_PORT")
                .or(fc.network.telemetry_port)
                .unwrap_or(defaults.telemetry_port),
            api_port: port("CAPTURE_SYNC_API_PORT")
                .or(fc.network.api_port)
                .unwrap_or(defaults.api_port),
            heartbeat_interval_secs: parsed("CAPTURE_SYNC_HEARTBEAT_SECS")
                .or(fc.liveness.heartbeat_interval_secs)
                .unwrap_or(defaults.heartbeat_interval_secs),
            lost_retention_ticks: fc
                .liveness
                .lost_retention_ticks
                .unwrap_or(defaults.lost_retention_ticks),
            command_timeout_ms: parsed("CAPTURE_SYNC_COMMAND_TIMEOUT_MS")
                .or(fc.commands.timeout_ms)
                .unwrap_or(defaults.command_timeout_ms),
            start_timeout_ms: parsed("CAPTURE_SYNC_START_TIMEOUT_MS")
                .or(fc.commands.start_timeout_ms)
                .unwrap_or(defaults.start_timeout_ms),
            idempotent_retries: fc
                .commands
                .idempotent_retries
                .unwrap_or(defaults.idempotent_retries),
            sync_latency_ceiling_ms: parsed("CAPTURE_SYNC_LATENCY_CEILING_MS")
                .or(fc.clock.latency_ceiling_ms)
                .unwrap_or(defaults.sync_latency_ceiling_ms),
            resync_interval_secs: fc
                .clock
                .resync_interval_secs
                .unwrap_or(defaults.resync_interval_secs),
            malformed_burst_limit: fc
                .liveness
                .malformed_burst_limit
                .unwrap_or(defaults.malformed_burst_limit),
            malformed_burst_window_secs: fc
                .liveness
                .malformed_burst_window_secs
                .unwrap_or(defaults.malformed_burst_window_secs),
            telemetry_buffer: fc.telemetry.buffer.unwrap_or(defaults.telemetry_buffer),
            advertise: env("CAPTURE_SYNC_ADVERTISE")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
                .or(fc.network.advertise)
                .unwrap_or(defaults.advertise),
        };

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `Error::Config` naming the first unusable value
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_secs == 0 {
            return Err(Error::Config("heartbeat interval must be positive".to_string()));
        }
        if self.command_timeout_ms == 0 || self.start_timeout_ms == 0 {
            return Err(Error::Config("command timeouts must be positive".to_string()));
        }
        if self.sync_latency_ceiling_ms == 0 {
            return Err(Error::Config("latency ceiling must be positive".to_string()));
        }
        if self.telemetry_buffer == 0 {
            return Err(Error::Config("telemetry buffer must be positive".to_string()));
        }
        if self.malformed_burst_limit == 0 {
            return Err(Error::Config("malformed burst limit must be positive".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    #[must_use]
    pub const fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    #[must_use]
    pub const fn sync_latency_ceiling(&self) -> Duration {
        Duration::from_millis(self.sync_latency_ceiling_ms)
    }

    #[must_use]
    pub const fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    #[must_use]
    pub const fn malformed_burst_window(&self) -> Duration {
        Duration::from_secs(self.malformed_burst_window_secs)
    }
}
