//! Application configuration
//!
//! Persisted as TOML in the platform configuration directory. Missing
//! files and missing keys fall back to defaults.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub effects: EffectsConfig,
    pub control: ControlConfig,
    pub output: OutputConfig,
}

impl AppConfig {
    /// Default location of the configuration file
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "micrelay", "mic-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, or defaults if there is no file
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| Error::Config("No configuration directory available".into()))?;
        self.save_to(&path)
    }

    /// Save to an explicit path, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Transport used by the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// TCP listener (Wi-Fi, or USB through ADB port forwarding)
    Tcp,
    /// RFCOMM service
    Bluetooth,
}

impl Default for ConnectionMode {
    fn default() -> Self {
        ConnectionMode::Tcp
    }
}

impl FromStr for ConnectionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "wifi" | "usb" => Ok(ConnectionMode::Tcp),
            "bluetooth" | "bt" => Ok(ConnectionMode::Bluetooth),
            other => Err(Error::Config(format!("Unknown connection mode: {}", other))),
        }
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Tcp => write!(f, "tcp"),
            ConnectionMode::Bluetooth => write!(f, "bluetooth"),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
    pub mode: ConnectionMode,
    /// Largest accepted frame body in bytes
    pub max_frame_len: usize,
    /// Delay between Bluetooth registration attempts
    pub bluetooth_retry_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            mode: ConnectionMode::Tcp,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            bluetooth_retry_ms: BLUETOOTH_RETRY_DELAY_MS,
        }
    }
}

/// Noise suppression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoiseReductionType {
    RNNoise,
    Ulunas,
    Speexdsp,
}

impl Default for NoiseReductionType {
    fn default() -> Self {
        NoiseReductionType::RNNoise
    }
}

/// Parameters of the processing chain, applied as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    pub enable_ns: bool,
    pub ns_type: NoiseReductionType,
    pub enable_agc: bool,
    /// Target RMS on the 16-bit scale
    pub agc_target_level: i32,
    pub enable_vad: bool,
    /// Sensitivity 0-100
    pub vad_threshold: i32,
    pub enable_dereverb: bool,
    /// Subtraction strength 0.0-1.0
    pub dereverb_level: f32,
    pub amplification: f32,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            enable_ns: false,
            ns_type: NoiseReductionType::RNNoise,
            enable_agc: false,
            agc_target_level: 32000,
            enable_vad: false,
            vad_threshold: 10,
            enable_dereverb: false,
            dereverb_level: 0.5,
            amplification: 1.0,
        }
    }
}

impl EffectsConfig {
    /// Every stage off and unity gain
    pub fn passthrough() -> Self {
        Self::default()
    }

    /// Preset for a noisy room
    pub fn voice() -> Self {
        Self {
            enable_ns: true,
            ns_type: NoiseReductionType::Speexdsp,
            enable_agc: true,
            agc_target_level: 8000,
            enable_vad: true,
            vad_threshold: 60,
            enable_dereverb: true,
            dereverb_level: 0.3,
            amplification: 1.0,
        }
    }
}

/// HTTP control API configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_CONTROL_PORT,
        }
    }
}

/// Playback configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output device name, `None` for the host default
    pub device_id: Option<String>,
    /// Play through the device; otherwise silence is written
    pub monitoring: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("wifi".parse::<ConnectionMode>().unwrap(), ConnectionMode::Tcp);
        assert_eq!("USB".parse::<ConnectionMode>().unwrap(), ConnectionMode::Tcp);
        assert_eq!("bt".parse::<ConnectionMode>().unwrap(), ConnectionMode::Bluetooth);
        assert!("serial".parse::<ConnectionMode>().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            port = 7000

            [effects]
            enable_agc = true
            "#,
        )
        .unwrap();

        assert_eq!(config.network.port, 7000);
        assert_eq!(config.network.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        assert!(config.effects.enable_agc);
        assert_eq!(config.effects.agc_target_level, 32000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.effects = EffectsConfig::voice();
        config.network.mode = ConnectionMode::Bluetooth;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
