//! Synchronization Engine Configuration
//!
//! Every field has a default so partial YAML/TOML documents deserialize;
//! `validate()` rejects inconsistent values instead of silently fixing them.

use crate::agc::AgcConfig;
use crate::correlator::CorrelationMode;
use crate::numerology::{Numerology, SUPPORTED_FFT_SIZES};
use crate::sequence::NPSS_NUM_SYMBOLS;
use crate::sss::SssStrategy;
use crate::PhyError;
use common::types::{CyclicPrefix, DuplexMode};
use serde::{Deserialize, Serialize};

/// Radio access profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadioProfile {
    /// LTE PSS/SSS, 5 ms search period
    #[default]
    Lte,
    /// NB-IoT NPSS/NSSS, 10 ms search period
    Nbiot,
}

/// Cell search and synchronization parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub profile: RadioProfile,
    /// FFT size (128..2048)
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    /// Analysis window in samples, 0 selects one search period
    #[serde(default)]
    pub window_len: usize,
    /// Scan budget in windows
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    /// Records needed before a variant stops scanning
    #[serde(default = "default_min_valid_frames")]
    pub min_valid_frames: usize,
    /// Minimum peak-to-side-lobe ratio for a detection
    #[serde(default = "default_psr_threshold")]
    pub psr_threshold: f32,
    /// Peak tracker EMA coefficient
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f32,
    #[serde(default)]
    pub correlation_mode: CorrelationMode,
    #[serde(default)]
    pub sss_strategy: SssStrategy,
    /// Equalize SSS with the PSS channel estimate
    #[serde(default = "default_true")]
    pub sss_equalization: bool,
    #[serde(default = "default_true")]
    pub cp_detection: bool,
    #[serde(default = "default_true")]
    pub duplex_detection: bool,
    /// CP assumed when detection is disabled
    #[serde(default)]
    pub default_cp: CyclicPrefix,
    /// Duplex mode assumed when detection is disabled
    #[serde(default)]
    pub default_duplex: DuplexMode,
    #[serde(default = "default_cfo_ema_alpha")]
    pub cfo_ema_alpha: f32,
    /// Broadcast decodes below this SNR are retried
    #[serde(default = "default_min_snr_db")]
    pub min_snr_db: f32,
    /// Frame-number acquisition budget in subframes
    #[serde(default = "default_sfn_timeout_subframes")]
    pub sfn_timeout_subframes: usize,
    /// Consecutive PSS misses tolerated while tracking
    #[serde(default = "default_max_track_misses")]
    pub max_track_misses: usize,
    #[serde(default)]
    pub agc: AgcConfig,
}

fn default_fft_size() -> usize {
    128
}

fn default_max_frames() -> usize {
    50
}

fn default_min_valid_frames() -> usize {
    8
}

fn default_psr_threshold() -> f32 {
    3.0
}

fn default_ema_alpha() -> f32 {
    0.2
}

fn default_true() -> bool {
    true
}

fn default_cfo_ema_alpha() -> f32 {
    0.3
}

fn default_min_snr_db() -> f32 {
    3.0
}

fn default_sfn_timeout_subframes() -> usize {
    1000
}

fn default_max_track_misses() -> usize {
    20
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            profile: RadioProfile::default(),
            fft_size: default_fft_size(),
            window_len: 0,
            max_frames: default_max_frames(),
            min_valid_frames: default_min_valid_frames(),
            psr_threshold: default_psr_threshold(),
            ema_alpha: default_ema_alpha(),
            correlation_mode: CorrelationMode::default(),
            sss_strategy: SssStrategy::default(),
            sss_equalization: true,
            cp_detection: true,
            duplex_detection: true,
            default_cp: CyclicPrefix::default(),
            default_duplex: DuplexMode::default(),
            cfo_ema_alpha: default_cfo_ema_alpha(),
            min_snr_db: default_min_snr_db(),
            sfn_timeout_subframes: default_sfn_timeout_subframes(),
            max_track_misses: default_max_track_misses(),
            agc: AgcConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Check the configuration for consistency
    pub fn validate(&self) -> Result<(), PhyError> {
        let numerology = self.numerology()?;

        let period = self.search_period(&numerology);
        if self.window_len != 0 && self.window_len % period != 0 {
            return Err(PhyError::InvalidConfig(format!(
                "window_len {} must be a multiple of the {:?} search period ({} samples)",
                self.window_len, self.profile, period
            )));
        }
        if self.max_frames == 0 {
            return Err(PhyError::InvalidConfig("max_frames must be at least 1".to_string()));
        }
        if self.min_valid_frames == 0 || self.min_valid_frames > self.max_frames {
            return Err(PhyError::InvalidConfig(format!(
                "min_valid_frames {} must be in 1..={}",
                self.min_valid_frames, self.max_frames
            )));
        }
        if !(self.psr_threshold > 0.0) || !self.psr_threshold.is_finite() {
            return Err(PhyError::InvalidConfig(format!(
                "psr_threshold must be positive, got {}",
                self.psr_threshold
            )));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(PhyError::InvalidConfig(format!(
                "ema_alpha must be in (0, 1], got {}",
                self.ema_alpha
            )));
        }
        if !(self.cfo_ema_alpha > 0.0 && self.cfo_ema_alpha <= 1.0) {
            return Err(PhyError::InvalidConfig(format!(
                "cfo_ema_alpha must be in (0, 1], got {}",
                self.cfo_ema_alpha
            )));
        }
        if !self.min_snr_db.is_finite() {
            return Err(PhyError::InvalidConfig("min_snr_db must be finite".to_string()));
        }
        if self.sfn_timeout_subframes == 0 {
            return Err(PhyError::InvalidConfig(
                "sfn_timeout_subframes must be at least 1".to_string(),
            ));
        }
        self.agc.validate()
    }

    pub fn numerology(&self) -> Result<Numerology, PhyError> {
        Numerology::new(self.fft_size).map_err(|_| {
            PhyError::InvalidConfig(format!(
                "fft_size {} not supported (expected one of {:?})",
                self.fft_size, SUPPORTED_FFT_SIZES
            ))
        })
    }

    /// Spacing of consecutive primary sequences
    pub fn search_period(&self, numerology: &Numerology) -> usize {
        match self.profile {
            RadioProfile::Lte => numerology.half_frame_len(),
            RadioProfile::Nbiot => numerology.frame_len(),
        }
    }

    /// Analysis window length in samples
    pub fn window_len(&self, numerology: &Numerology) -> usize {
        if self.window_len == 0 {
            self.search_period(numerology)
        } else {
            self.window_len
        }
    }

    /// Length of the longest reference kernel for the profile
    pub fn max_kernel_len(&self, numerology: &Numerology) -> usize {
        let n = numerology.fft_size();
        match self.profile {
            RadioProfile::Lte => n + numerology.cp_len(CyclicPrefix::Normal, 1),
            RadioProfile::Nbiot => (0..NPSS_NUM_SYMBOLS)
                .map(|i| n + numerology.cp_len(CyclicPrefix::Normal, i + 3))
                .sum(),
        }
    }

    /// Samples kept from previous windows ahead of each new window
    ///
    /// Covers the kernel overlap plus the lookback needed for CP
    /// classification and the secondary sequence (LTE) or one full frame
    /// for the previous NSSS (NB-IoT).
    pub fn history_len(&self, numerology: &Numerology) -> usize {
        let n = numerology.fft_size();
        let overlap = self.max_kernel_len(numerology) - 1;
        match self.profile {
            RadioProfile::Lte => overlap + 5 * (n + n / 4),
            RadioProfile::Nbiot => overlap + numerology.frame_len(),
        }
    }

    /// Upper bound on correlation profile length
    pub fn max_profile_len(&self, numerology: &Numerology) -> usize {
        self.window_len(numerology) + self.max_kernel_len(numerology) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());

        let num = config.numerology().unwrap();
        assert_eq!(config.window_len(&num), 9600);
        assert_eq!(config.max_kernel_len(&num), 137);
        assert_eq!(config.max_profile_len(&num), 9600 + 136);
        assert_eq!(config.history_len(&num), 136 + 800);
    }

    #[test]
    fn test_nbiot_window() {
        let config = SyncConfig {
            profile: RadioProfile::Nbiot,
            ..SyncConfig::default()
        };
        let num = config.numerology().unwrap();
        assert_eq!(config.window_len(&num), 19200);
        // 11 symbols of 137 samples, symbol 7 carries the long CP
        assert_eq!(config.max_kernel_len(&num), 11 * 137 + 1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            SyncConfig {
                fft_size: 100,
                ..SyncConfig::default()
            },
            SyncConfig {
                window_len: 1000,
                ..SyncConfig::default()
            },
            SyncConfig {
                min_valid_frames: 60,
                ..SyncConfig::default()
            },
            SyncConfig {
                psr_threshold: 0.0,
                ..SyncConfig::default()
            },
            SyncConfig {
                ema_alpha: 1.5,
                ..SyncConfig::default()
            },
            SyncConfig {
                cfo_ema_alpha: 0.0,
                ..SyncConfig::default()
            },
            SyncConfig {
                sfn_timeout_subframes: 0,
                ..SyncConfig::default()
            },
            SyncConfig {
                max_frames: 0,
                min_valid_frames: 0,
                ..SyncConfig::default()
            },
        ];
        for config in cases.iter() {
            assert!(
                matches!(config.validate(), Err(PhyError::InvalidConfig(_))),
                "{:?} accepted",
                config
            );
        }

        let multiple = SyncConfig {
            window_len: 2 * 9600,
            ..SyncConfig::default()
        };
        assert!(multiple.validate().is_ok());
        let num = multiple.numerology().unwrap();
        assert_eq!(multiple.window_len(&num), 2 * multiple.search_period(&num));
    }

    #[test]
    fn test_partial_document() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"fft_size": 256, "sss_strategy": "differential", "agc": {"enabled": true}}"#)
                .unwrap();
        assert_eq!(config.fft_size, 256);
        assert_eq!(config.sss_strategy, SssStrategy::Differential);
        assert_eq!(config.max_frames, 50);
        assert!(config.agc.enabled);
        assert_eq!(config.agc.max_step_db, 3.0);
        assert!(config.validate().is_ok());
    }
}
