//! Automatic Gain Control
//!
//! The controller is a pure function of measured power; it never touches
//! the sample path. The engine publishes window power through a
//! [`PowerMeter`] and whoever runs the controller applies the resulting
//! gain to the front-end's `GainHandle`.

use crate::PhyError;
use common::utils::power_to_db;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// AGC configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgcConfig {
    pub enabled: bool,
    /// Desired mean sample power in dB
    pub target_power_db: f32,
    /// Largest gain change per update in dB
    pub max_step_db: f32,
    pub min_gain_db: f32,
    pub max_gain_db: f32,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_power_db: -15.0,
            max_step_db: 3.0,
            min_gain_db: -30.0,
            max_gain_db: 40.0,
        }
    }
}

impl AgcConfig {
    pub fn validate(&self) -> Result<(), PhyError> {
        if !(self.max_step_db > 0.0) {
            return Err(PhyError::InvalidConfig(format!(
                "agc.max_step_db must be positive, got {}",
                self.max_step_db
            )));
        }
        if !(self.min_gain_db <= self.max_gain_db) {
            return Err(PhyError::InvalidConfig(format!(
                "agc gain range [{}, {}] is empty",
                self.min_gain_db, self.max_gain_db
            )));
        }
        if !self.target_power_db.is_finite() {
            return Err(PhyError::InvalidConfig("agc.target_power_db must be finite".to_string()));
        }
        Ok(())
    }
}

/// Gain controller
#[derive(Debug, Clone)]
pub struct Agc {
    config: AgcConfig,
    gain_db: f32,
}

impl Agc {
    pub fn new(config: AgcConfig, initial_gain_db: f32) -> Self {
        Self {
            config,
            gain_db: initial_gain_db.max(config.min_gain_db).min(config.max_gain_db),
        }
    }

    pub fn gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Step the gain towards the target given the measured power (after gain)
    pub fn update(&mut self, measured_power_db: f32) -> f32 {
        if !measured_power_db.is_finite() {
            return self.gain_db;
        }
        let step = (self.config.target_power_db - measured_power_db)
            .max(-self.config.max_step_db)
            .min(self.config.max_step_db);
        self.gain_db = (self.gain_db + step)
            .max(self.config.min_gain_db)
            .min(self.config.max_gain_db);
        self.gain_db
    }
}

/// Latest measured window power, shared with the AGC task
#[derive(Debug, Clone)]
pub struct PowerMeter(Arc<AtomicU32>);

impl PowerMeter {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(f32::NAN.to_bits())))
    }

    pub fn publish(&self, power_db: f32) {
        self.0.store(power_db.to_bits(), Ordering::Relaxed);
    }

    /// Most recent measurement, `None` before the first window
    pub fn latest(&self) -> Option<f32> {
        let v = f32::from_bits(self.0.load(Ordering::Relaxed));
        if v.is_nan() {
            None
        } else {
            Some(v)
        }
    }
}

impl Default for PowerMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean sample power in dB
pub fn mean_power_db(samples: &[Complex32]) -> f32 {
    if samples.is_empty() {
        return power_to_db(0.0);
    }
    let power: f32 = samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / samples.len() as f32;
    power_to_db(power)
}
