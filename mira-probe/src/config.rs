//! Probe configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the probe.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProbeConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Stream parsing settings.
    pub stream: StreamConfig,
    /// Load governor settings.
    pub governor: GovernorSection,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// "listen" waits for the device to connect; "connect" dials a
    /// loopback forwarder.
    pub mode: String,
    /// TCP port (0 = ephemeral, listen mode only).
    pub port: u32,
    /// Connection readiness timeout in milliseconds.
    pub timeout_ms: u64,
}

/// Stream parsing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// The transport delivers a bare Annex-B stream with no framing.
    pub raw: bool,
    /// Interval between stats reports, in seconds.
    pub report_interval_secs: u64,
}

/// Load governor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorSection {
    /// Run the memory governor.
    pub enabled: bool,
    /// Also enable the CPU governor (off by default; its sampling cost
    /// is rarely worth it on desktop hosts).
    pub cpu_enabled: bool,
    /// Sampling cadence in seconds.
    pub sample_interval_secs: u64,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: "listen".into(),
            port: 7800,
            timeout_ms: 10_000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            raw: false,
            report_interval_secs: 5,
        }
    }
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_enabled: false,
            sample_interval_secs: 2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

/// Where the effective configuration came from. Loading happens before
/// the tracing subscriber is installed, so the caller logs the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Parsed from the file.
    File,
    /// No file at the path; defaults in effect.
    Missing,
    /// File present but unparsable; defaults in effect.
    Invalid(String),
}

impl ProbeConfig {
    /// Load from a TOML file, falling back to defaults. Never logs.
    pub fn load(path: &Path) -> (Self, ConfigSource) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(cfg) => (cfg, ConfigSource::File),
                Err(e) => (Self::default(), ConfigSource::Invalid(e.to_string())),
            },
            Err(_) => (Self::default(), ConfigSource::Missing),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
