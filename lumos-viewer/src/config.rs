//! Viewer configuration.

use std::path::Path;

use lumos_core::{ConnectionParams, SerialOptions, Timeout, TransportExtra, TransportKind};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the viewer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Sensor link.
    pub link: LinkConfig,
    /// Timeout enforcement and watchdog.
    pub timeouts: TimeoutConfig,
    /// Point buffer geometry.
    pub cloud: CloudConfig,
    /// Polling cadence.
    pub poll: PollConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Sensor link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// `tcp`, `udp` or `serial`.
    pub kind: TransportKind,
    /// IP literal (`*` listens, UDP only) or serial port name.
    pub endpoint: String,
    /// Port number or baud rate.
    pub number: u32,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u32,
    /// Reopen the link after the watchdog reports it lost.
    pub auto_reconnect: bool,
    /// Framing, used when `kind` is `serial`.
    pub serial: SerialOptions,
}

/// Which operations the link bounds, and the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub watchdog: bool,
    pub watchdog_interval_ms: u64,
    pub connect: bool,
    pub send: bool,
    pub receive: bool,
}

/// Point buffer geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Angular resolution of one sample, in degrees.
    pub resolution_deg: f32,
    /// Display scale.
    pub pixels_per_meter: f32,
    /// Fill the buffer with a synthetic scan while no data arrives.
    pub demo: bool,
}

/// Polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Refresh period in milliseconds.
    pub interval_ms: u64,
    /// Receive timeout in milliseconds.
    pub receive_timeout_ms: u32,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            endpoint: "192.168.0.10".into(),
            number: 2368,
            connect_timeout_ms: 1000,
            auto_reconnect: false,
            serial: SerialOptions::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            watchdog: true,
            watchdog_interval_ms: 1000,
            connect: true,
            send: true,
            receive: true,
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            resolution_deg: 0.3,
            pixels_per_meter: 100.0,
            demo: false,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            receive_timeout_ms: 5000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Derived values ───────────────────────────────────────────────

impl LinkConfig {
    /// Connection parameters for the configured transport.
    pub fn params(&self) -> ConnectionParams {
        let params = ConnectionParams::new(self.endpoint.clone(), self.number);
        match self.kind {
            TransportKind::Serial => params.with_extra(TransportExtra::Serial(self.serial)),
            _ => params,
        }
    }

    pub fn connect_timeout(&self) -> Timeout {
        Timeout::from_millis(self.connect_timeout_ms)
    }
}

impl PollConfig {
    pub fn receive_timeout(&self) -> Timeout {
        Timeout::from_millis(self.receive_timeout_ms)
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ViewerConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write default config to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }
}

// ── Tests ────────────────────────────────────────────────────────
