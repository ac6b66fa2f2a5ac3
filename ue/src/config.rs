//! UE Application Configuration
//!
//! A single document with the engine parameters, the sample source and the
//! log settings. YAML, TOML and JSON are accepted; the format follows the
//! file extension.

use anyhow::{anyhow, Context, Result};
use phy::synth::SynthConfig;
use phy::SyncConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct UeConfig {
    /// Cell search and synchronization parameters
    #[serde(default)]
    pub sync: SyncConfig,
    /// Sample source
    #[serde(default)]
    pub rf: RfConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Where samples come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RfSource {
    /// Built-in synthetic downlink
    #[default]
    Synthetic,
    /// srsRAN-compatible ZMQ sample link
    Zmq,
}

/// RF front-end configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RfConfig {
    #[serde(default)]
    pub source: RfSource,
    /// ZMQ device arguments in srsRAN format
    #[serde(default = "default_device_args")]
    pub device_args: String,
    /// Downlink carrier frequency in Hz
    #[serde(default = "default_frequency_hz")]
    pub frequency_hz: f64,
    /// Initial receive gain in dB
    #[serde(default)]
    pub rx_gain_db: f32,
    /// Synthetic downlink parameters
    #[serde(default)]
    pub synthetic: SynthConfig,
}

fn default_device_args() -> String {
    "rx_port=tcp://localhost:2000,base_srate=1.92e6".to_string()
}

fn default_frequency_hz() -> f64 {
    // Band 3, EARFCN 1575
    1842.5e6
}

impl Default for RfConfig {
    fn default() -> Self {
        Self {
            source: RfSource::default(),
            device_args: default_device_args(),
            frequency_hz: default_frequency_hz(),
            rx_gain_db: 0.0,
            synthetic: SynthConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration document format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "yml" | "yaml" => Ok(ConfigFormat::Yaml),
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(anyhow!("Unsupported configuration file type: {}", path.display())),
        }
    }
}

impl UeConfig {
    /// Load configuration from a file, choosing the parser by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&contents, format).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(contents: &str, format: ConfigFormat) -> Result<Self> {
        let config = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(contents)?,
            ConfigFormat::Toml => toml::from_str(contents)?,
            ConfigFormat::Json => serde_json::from_str(contents)?,
        };
        Ok(config)
    }

    /// Check every section; the synthetic source follows the engine numerology
    pub fn validate(&mut self) -> Result<()> {
        self.sync.validate()?;
        if !(self.rf.frequency_hz > 0.0) {
            return Err(anyhow!("rf.frequency_hz must be positive, got {}", self.rf.frequency_hz));
        }
        self.rf.synthetic.profile = self.sync.profile;
        self.rf.synthetic.fft_size = self.sync.fft_size;
        Ok(())
    }
}
