//! Pipeline configuration persisted as JSON
//!
//! Stored at ~/.config/yeti-talki/config.json. A missing file means defaults.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Recording limits and tick cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Hard ceiling; recording stops automatically when reached
    pub max_duration_secs: f64,
    /// Recordings shorter than this are discarded instead of sent
    pub min_duration_secs: f64,
    /// Level sample / elapsed tick period
    pub tick_interval_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 30.0,
            min_duration_secs: 0.3,
            tick_interval_ms: 100,
        }
    }
}

impl RecordingConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Seconds added to the elapsed time on every tick
    pub fn tick_step_secs(&self) -> f64 {
        self.elapsed_secs(1)
    }

    /// Elapsed time after `ticks` ticks, exact for whole milliseconds
    pub fn elapsed_secs(&self, ticks: u32) -> f64 {
        ticks as u64 as f64 * self.tick_interval_ms as f64 / 1000.0
    }

    /// Number of ticks after which the cutoff fires
    ///
    /// Rounded down so the elapsed time never passes the ceiling.
    pub fn max_ticks(&self) -> u32 {
        if self.tick_interval_ms == 0 {
            return 0;
        }
        let ticks = self.max_duration_secs * 1000.0 / self.tick_interval_ms as f64;
        (ticks + 1e-9).floor().max(0.0) as u32
    }
}

/// Microphone capture format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Requested sample rate; devices may report a different native rate
    pub sample_rate: u32,
    /// Window length of the level analyser
    pub fft_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            fft_size: 256,
        }
    }
}

/// Channel connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint of the broadcast channel
    pub server_url: String,
    pub connect_timeout_secs: u64,
    /// Outbound payloads larger than this are refused locally
    pub max_payload_bytes: usize,
    /// Capacity of the inbound event subscription
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8002/ws".to_string(),
            connect_timeout_secs: 15,
            max_payload_bytes: 8 * 1024 * 1024,
            event_capacity: 32,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Development relay settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: String,
    /// Broadcasts declaring a longer duration are rejected
    pub max_duration_secs: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8002".to_string(),
            max_duration_secs: 30.0,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkiConfig {
    pub recording: RecordingConfig,
    pub capture: CaptureConfig,
    pub transport: TransportConfig,
    pub relay: RelayConfig,
}

impl TalkiConfig {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("yeti-talki")
            .join("config.json")
    }

    /// Load from the default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load from a file, falling back to defaults when it does not exist
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: TalkiConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write to a file, creating parent directories
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let rec = &self.recording;
        if rec.max_duration_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "recording.max_duration_secs must be positive".to_string(),
            ));
        }
        if rec.min_duration_secs < 0.0 || rec.min_duration_secs > rec.max_duration_secs {
            return Err(ConfigError::Invalid(
                "recording.min_duration_secs must be between 0 and max_duration_secs".to_string(),
            ));
        }
        if rec.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "recording.tick_interval_ms must be non-zero".to_string(),
            ));
        }
        if rec.max_ticks() == 0 {
            return Err(ConfigError::Invalid(
                "recording.tick_interval_ms must not exceed max_duration_secs".to_string(),
            ));
        }
        if self.capture.fft_size < 2 || !self.capture.fft_size.is_power_of_two() {
            return Err(ConfigError::Invalid(
                "capture.fft_size must be a power of two".to_string(),
            ));
        }
        if self.relay.max_duration_secs <= 0.0 {
            return Err(ConfigError::Invalid(
                "relay.max_duration_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
