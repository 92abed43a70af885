//! TOML configuration file loading
//!
//! Supports `~/.config/capture-sync/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CaptureSyncConfigFile {
    /// Listener configuration
    #[serde(default)]
    pub network: NetworkFileConfig,

    /// Heartbeat and connection hygiene
    #[serde(default)]
    pub liveness: LivenessFileConfig,

    /// Command deadlines and retries
    #[serde(default)]
    pub commands: CommandsFileConfig,

    /// Clock synchronization
    #[serde(default)]
    pub clock: ClockFileConfig,

    /// Telemetry fan-out
    #[serde(default)]
    pub telemetry: TelemetryFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct NetworkFileConfig {
    /// Address all listeners bind to (e.g. "0.0.0.0")
    pub bind: Option<String>,
    pub control_port: Option<u16>,
    pub telemetry_port: Option<u16>,
    pub api_port: Option<u16>,
    /// Advertise the controller over mDNS
    pub advertise: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LivenessFileConfig {
    pub heartbeat_interval_secs: Option<u64>,
    /// Ticks a LOST record is kept before it is pruned
    pub lost_retention_ticks: Option<u32>,
    pub malformed_burst_limit: Option<usize>,
    pub malformed_burst_window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommandsFileConfig {
    pub timeout_ms: Option<u64>,
    pub start_timeout_ms: Option<u64>,
    pub idempotent_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClockFileConfig {
    pub latency_ceiling_ms: Option<u64>,
    pub resync_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TelemetryFileConfig {
    /// Frames buffered per stream before slow subscribers drop
    pub buffer: Option<usize>,
}

/// Load config file from the default location
///
/// Returns default config if the file doesn't exist or can't be parsed
#[must_use]
pub fn load_config_file() -> CaptureSyncConfigFile {
    let Some(path) = config_file_path() else {
        return CaptureSyncConfigFile::default();
    };

    load_config_file_from(&path)
}

/// Load config file from an explicit path, falling back to defaults
#[must_use]
pub fn load_config_file_from(path: &Path) -> CaptureSyncConfigFile {
    if !path.exists() {
        return CaptureSyncConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                CaptureSyncConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            CaptureSyncConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/capture-sync/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("capture-sync").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_partial_overlay() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[network]\ncontrol_port = 9000\n\n[clock]\nlatency_ceiling_ms = 250\n"
        )
        .unwrap();

        let config = load_config_file_from(file.path());
        assert_eq!(config.network.control_port, Some(9000));
        assert_eq!(config.network.api_port, None);
        assert_eq!(config.clock.latency_ceiling_ms, Some(250));
        assert_eq!(config.liveness.heartbeat_interval_secs, None);
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network\ncontrol_port = ").unwrap();

        let config = load_config_file_from(file.path());
        assert_eq!(config.network.control_port, None);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_file_from(&dir.path().join("absent.toml"));
        assert!(config.telemetry.buffer.is_none());
    }
}
