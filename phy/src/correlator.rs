//! Sliding Cross-Correlator
//!
//! Full cross-correlation of a sample window against a reference kernel.
//! Profile index `i` corresponds to the kernel starting at window sample
//! `i - (K - 1)`; the profile length is `W + K - 1`.

use crate::PhyError;
use common::utils::next_power_of_2;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

/// Correlation output scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMode {
    /// |c|²
    #[default]
    Power,
    /// |c|
    Magnitude,
}

impl CorrelationMode {
    fn apply(&self, c: Complex32) -> f32 {
        match self {
            CorrelationMode::Power => c.norm_sqr(),
            CorrelationMode::Magnitude => c.norm(),
        }
    }
}

/// FFT correlation state for one (kernel, window) geometry
struct FftGeometry {
    window_len: usize,
    kernel: Vec<Complex32>,
    nfft: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    /// Spectrum of the conjugated, time-reversed kernel
    kernel_spectrum: Vec<Complex32>,
    buffer: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

/// Cross-correlator with cached kernel spectrum
pub struct Correlator {
    mode: CorrelationMode,
    planner: FftPlanner<f32>,
    geometry: Option<FftGeometry>,
}

impl Correlator {
    pub fn new(mode: CorrelationMode) -> Self {
        Self {
            mode,
            planner: FftPlanner::new(),
            geometry: None,
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    /// Correlate `window` against `kernel` into a new profile
    pub fn correlate(&mut self, window: &[Complex32], kernel: &[Complex32]) -> Result<Vec<f32>, PhyError> {
        let mut profile = Vec::new();
        self.correlate_into(window, kernel, &mut profile)?;
        Ok(profile)
    }

    /// Correlate `window` against `kernel`, replacing the contents of `profile`
    pub fn correlate_into(
        &mut self,
        window: &[Complex32],
        kernel: &[Complex32],
        profile: &mut Vec<f32>,
    ) -> Result<(), PhyError> {
        if window.is_empty() || kernel.is_empty() {
            return Err(PhyError::InvalidConfig(format!(
                "Cannot correlate window of {} against kernel of {} samples",
                window.len(),
                kernel.len()
            )));
        }

        let out_len = window.len() + kernel.len() - 1;
        profile.clear();
        profile
            .try_reserve(out_len)
            .map_err(|e| PhyError::AllocationFailure(format!("correlation profile: {}", e)))?;

        if window.len() <= kernel.len() {
            self.correlate_direct(window, kernel, profile);
        } else {
            self.correlate_fft(window, kernel, profile)?;
        }
        Ok(())
    }

    fn correlate_direct(&self, window: &[Complex32], kernel: &[Complex32], profile: &mut Vec<f32>) {
        let w = window.len() as isize;
        let k = kernel.len() as isize;

        for i in 0..(w + k - 1) {
            let start = i - (k - 1);
            let lo = (-start).max(0);
            let hi = k.min(w - start);
            let mut acc = Complex32::new(0.0, 0.0);
            for j in lo..hi {
                acc += window[(start + j) as usize] * kernel[j as usize].conj();
            }
            profile.push(self.mode.apply(acc));
        }
    }

    fn correlate_fft(
        &mut self,
        window: &[Complex32],
        kernel: &[Complex32],
        profile: &mut Vec<f32>,
    ) -> Result<(), PhyError> {
        let out_len = window.len() + kernel.len() - 1;
        let stale = match &self.geometry {
            Some(g) => g.window_len != window.len() || g.kernel.as_slice() != kernel,
            None => true,
        };
        if stale {
            self.geometry = Some(self.plan(window.len(), kernel)?);
        }

        let mode = self.mode;
        let geometry = self
            .geometry
            .as_mut()
            .ok_or_else(|| PhyError::ProcessingError("correlator geometry missing".to_string()))?;

        let zero = Complex32::new(0.0, 0.0);
        geometry.buffer[..window.len()].copy_from_slice(window);
        geometry.buffer[window.len()..].fill(zero);

        geometry.fft.process_with_scratch(&mut geometry.buffer, &mut geometry.scratch);
        for (x, h) in geometry.buffer.iter_mut().zip(geometry.kernel_spectrum.iter()) {
            *x *= h;
        }
        geometry.ifft.process_with_scratch(&mut geometry.buffer, &mut geometry.scratch);

        let norm = 1.0 / geometry.nfft as f32;
        profile.extend(geometry.buffer[..out_len].iter().map(|&c| mode.apply(c * norm)));
        Ok(())
    }

    fn plan(&mut self, window_len: usize, kernel: &[Complex32]) -> Result<FftGeometry, PhyError> {
        let nfft = next_power_of_2(window_len + kernel.len() - 1);
        trace!(
            "Planning correlator: window {} kernel {} nfft {}",
            window_len,
            kernel.len(),
            nfft
        );

        let fft = self.planner.plan_fft_forward(nfft);
        let ifft = self.planner.plan_fft_inverse(nfft);
        let zero = Complex32::new(0.0, 0.0);

        let mut kernel_spectrum = crate::try_alloc(nfft, zero, "kernel spectrum")?;
        for (dst, src) in kernel_spectrum.iter_mut().zip(kernel.iter().rev()) {
            *dst = src.conj();
        }
        let scratch_len = fft.get_inplace_scratch_len().max(ifft.get_inplace_scratch_len());
        let mut scratch = crate::try_alloc(scratch_len, zero, "FFT scratch")?;
        fft.process_with_scratch(&mut kernel_spectrum, &mut scratch);

        Ok(FftGeometry {
            window_len,
            kernel: kernel.to_vec(),
            nfft,
            fft,
            ifft,
            kernel_spectrum,
            buffer: crate::try_alloc(nfft, zero, "correlation buffer")?,
            scratch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_signal(rng: &mut StdRng, len: usize) -> Vec<Complex32> {
        (0..len)
            .map(|_| Complex32::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect()
    }

    /// Reference correlation straight from the definition
    fn reference(window: &[Complex32], kernel: &[Complex32]) -> Vec<f32> {
        let k = kernel.len() as isize;
        (0..(window.len() + kernel.len() - 1) as isize)
            .map(|i| {
                let start = i - (k - 1);
                let mut acc = Complex32::new(0.0, 0.0);
                for j in 0..k {
                    let idx = start + j;
                    if idx >= 0 && (idx as usize) < window.len() {
                        acc += window[idx as usize] * kernel[j as usize].conj();
                    }
                }
                acc.norm_sqr()
            })
            .collect()
    }

    #[test]
    fn test_direct_and_fft_agree() {
        let mut rng = StdRng::seed_from_u64(7);
        let kernel = random_signal(&mut rng, 37);
        let window = random_signal(&mut rng, 300);

        let mut correlator = Correlator::new(CorrelationMode::Power);
        let fft_profile = correlator.correlate(&window, &kernel).unwrap();
        let expected = reference(&window, &kernel);
        assert_eq!(fft_profile.len(), 300 + 37 - 1);
        for (a, b) in fft_profile.iter().zip(expected.iter()) {
            assert!((a - b).abs() <= 1e-3 * b.max(1.0), "{} vs {}", a, b);
        }

        // Window no longer than the kernel takes the direct path
        let short = &window[..30];
        let direct = correlator.correlate(short, &kernel).unwrap();
        let expected = reference(short, &kernel);
        assert_eq!(direct.len(), 30 + 37 - 1);
        for (a, b) in direct.iter().zip(expected.iter()) {
            assert!((a - b).abs() <= 1e-4 * b.max(1.0));
        }
    }

    #[test]
    fn test_peak_at_kernel_position() {
        let mut rng = StdRng::seed_from_u64(11);
        let kernel = random_signal(&mut rng, 64);
        let mut window = vec![Complex32::new(0.0, 0.0); 1000];
        window[250..314].copy_from_slice(&kernel);

        let mut correlator = Correlator::new(CorrelationMode::Magnitude);
        let profile = correlator.correlate(&window, &kernel).unwrap();
        let (idx, _) = profile
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
        assert_eq!(idx, 250 + 64 - 1);

        let energy: f32 = kernel.iter().map(|s| s.norm_sqr()).sum();
        assert!((profile[idx] - energy).abs() < 1e-2 * energy);
    }

    #[test]
    fn test_kernel_change_replans() {
        let mut rng = StdRng::seed_from_u64(3);
        let k1 = random_signal(&mut rng, 16);
        let k2 = random_signal(&mut rng, 16);
        let window = random_signal(&mut rng, 200);

        let mut correlator = Correlator::new(CorrelationMode::Power);
        let _ = correlator.correlate(&window, &k1).unwrap();
        let p2 = correlator.correlate(&window, &k2).unwrap();
        let expected = reference(&window, &k2);
        for (a, b) in p2.iter().zip(expected.iter()) {
            assert!((a - b).abs() <= 1e-3 * b.max(1.0));
        }
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let mut correlator = Correlator::new(CorrelationMode::Power);
        let kernel = vec![Complex32::new(1.0, 0.0); 4];
        assert!(matches!(correlator.correlate(&[], &kernel), Err(PhyError::InvalidConfig(_))));
        assert!(matches!(correlator.correlate(&kernel, &[]), Err(PhyError::InvalidConfig(_))));
    }
}
