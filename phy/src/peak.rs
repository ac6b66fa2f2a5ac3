//! Peak Tracker
//!
//! Exponentially smoothed correlation profile with arg-max and
//! peak-to-side-lobe ratio (PSR) measurement.

use crate::PhyError;
use tracing::trace;

/// Default EMA coefficient
pub const DEFAULT_EMA_ALPHA: f32 = 0.2;

/// Peak measurement for one profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakReport {
    /// Arg-max index in the smoothed profile
    pub index: usize,
    /// Smoothed value at the peak
    pub smoothed: f32,
    /// Instantaneous value at the peak
    pub instantaneous: f32,
    /// Lag of the peak relative to the profile's lag origin
    pub offset: isize,
    pub psr: f32,
}

/// Smoothed profile state for one search session
#[derive(Debug, Clone)]
pub struct PeakTracker {
    alpha: f32,
    max_len: usize,
    smoothed: Vec<f32>,
}

impl PeakTracker {
    pub fn new(alpha: f32, max_len: usize) -> Result<Self, PhyError> {
        if !(alpha > 0.0) {
            return Err(PhyError::InvalidConfig(format!("EMA alpha must be positive, got {}", alpha)));
        }
        Ok(Self {
            alpha,
            max_len,
            smoothed: Vec::new(),
        })
    }

    /// Clear the smoothed profile (session start, PCI change, resync)
    pub fn reset(&mut self) {
        self.smoothed.clear();
    }

    pub fn smoothed(&self) -> &[f32] {
        &self.smoothed
    }

    /// Fold `profile` into the smoothed profile and locate the peak
    ///
    /// `lag_origin` is the profile index that corresponds to zero lag.
    pub fn update(&mut self, profile: &[f32], lag_origin: usize) -> Result<PeakReport, PhyError> {
        if profile.is_empty() {
            return Err(PhyError::InvalidConfig("Empty correlation profile".to_string()));
        }
        if profile.len() > self.max_len {
            return Err(PhyError::InvalidConfig(format!(
                "Profile of {} entries exceeds maximum {}",
                profile.len(),
                self.max_len
            )));
        }

        if self.smoothed.len() != profile.len() {
            trace!("Resetting smoothed profile to {} entries", profile.len());
            self.smoothed.clear();
            self.smoothed
                .try_reserve_exact(profile.len())
                .map_err(|e| PhyError::AllocationFailure(format!("smoothed profile: {}", e)))?;
            self.smoothed.resize(profile.len(), 0.0);
        }

        if self.alpha >= 1.0 {
            self.smoothed.copy_from_slice(profile);
        } else {
            let alpha = self.alpha;
            for (s, &p) in self.smoothed.iter_mut().zip(profile.iter()) {
                *s = alpha * p + (1.0 - alpha) * *s;
            }
        }

        let index = arg_max(&self.smoothed);
        let psr = peak_to_sidelobe(&self.smoothed, index);

        Ok(PeakReport {
            index,
            smoothed: self.smoothed[index],
            instantaneous: profile[index],
            offset: index as isize - lag_origin as isize,
            psr,
        })
    }
}

/// Index of the first maximum
pub fn arg_max(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Peak-to-side-lobe ratio around `peak`
///
/// The main lobe extends left and right while the profile keeps falling;
/// the side lobe is the largest value outside it. Returns +∞ when there
/// is no side lobe and the peak is positive, 0 for an all-zero profile.
pub fn peak_to_sidelobe(profile: &[f32], peak: usize) -> f32 {
    if profile.is_empty() || peak >= profile.len() {
        return 0.0;
    }
    let peak_value = profile[peak];
    if peak_value <= 0.0 {
        return 0.0;
    }

    let mut left = peak;
    while left > 0 && profile[left - 1] <= profile[left] {
        left -= 1;
    }
    let mut right = peak;
    while right + 1 < profile.len() && profile[right + 1] <= profile[right] {
        right += 1;
    }

    let side_left = profile[..left].iter().cloned().fold(0.0f32, f32::max);
    let side_right = profile[right + 1..].iter().cloned().fold(0.0f32, f32::max);
    let side = side_left.max(side_right);

    if side > 0.0 {
        peak_value / side
    } else {
        f32::INFINITY
    }
}
