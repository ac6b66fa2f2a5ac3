//! OFDM Modulation and Demodulation
//!
//! Symbol-level transforms used to synthesize reference kernels and to
//! move received synchronization symbols into the frequency domain.
//! `rustfft` is the default backend; the `fftw` feature switches the
//! modulator to FFTW plans.

use crate::PhyError;
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

#[cfg(feature = "fftw")]
use fftw::array::AlignedVec;
#[cfg(feature = "fftw")]
use fftw::plan::{C2CPlan, C2CPlan32};
#[cfg(feature = "fftw")]
use fftw::types::{Flag, Sign};

/// Bin index of the subcarrier `k` positions away from DC
pub fn subcarrier_bin(k: i32, fft_size: usize) -> usize {
    k.rem_euclid(fft_size as i32) as usize
}

/// OFDM modulator (IFFT + cyclic prefix)
pub struct OfdmModulator {
    fft_size: usize,
    scale: f32,
    #[cfg(not(feature = "fftw"))]
    ifft: Arc<dyn Fft<f32>>,
    #[cfg(not(feature = "fftw"))]
    buffer: Vec<Complex32>,
    #[cfg(feature = "fftw")]
    ifft_plan: C2CPlan32,
    #[cfg(feature = "fftw")]
    ifft_input: AlignedVec<Complex32>,
    #[cfg(feature = "fftw")]
    ifft_output: AlignedVec<Complex32>,
}

impl OfdmModulator {
    #[cfg(not(feature = "fftw"))]
    pub fn new(fft_size: usize) -> Result<Self, PhyError> {
        if fft_size == 0 {
            return Err(PhyError::InvalidConfig("FFT size must be positive".to_string()));
        }
        let ifft = FftPlanner::new().plan_fft_inverse(fft_size);
        Ok(Self {
            fft_size,
            scale: 1.0 / (fft_size as f32).sqrt(),
            ifft,
            buffer: crate::try_alloc(fft_size, Complex32::new(0.0, 0.0), "IFFT buffer")?,
        })
    }

    #[cfg(feature = "fftw")]
    pub fn new(fft_size: usize) -> Result<Self, PhyError> {
        if fft_size == 0 {
            return Err(PhyError::InvalidConfig("FFT size must be positive".to_string()));
        }
        let ifft_plan = C2CPlan32::aligned(&[fft_size], Sign::Backward, Flag::ESTIMATE)
            .map_err(|e| PhyError::InvalidConfig(format!("Failed to create IFFT plan: {:?}", e)))?;
        Ok(Self {
            fft_size,
            scale: 1.0 / (fft_size as f32).sqrt(),
            ifft_plan,
            ifft_input: AlignedVec::new(fft_size),
            ifft_output: AlignedVec::new(fft_size),
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Modulate one symbol and append CP + useful part to `out`
    pub fn modulate_into(
        &mut self,
        spectrum: &[Complex32],
        cp_len: usize,
        out: &mut Vec<Complex32>,
    ) -> Result<(), PhyError> {
        if spectrum.len() != self.fft_size {
            return Err(PhyError::InvalidConfig(format!(
                "Expected {} subcarriers, got {}",
                self.fft_size,
                spectrum.len()
            )));
        }
        if cp_len > self.fft_size {
            return Err(PhyError::InvalidConfig(format!(
                "CP length {} exceeds FFT size {}",
                cp_len, self.fft_size
            )));
        }
        out.try_reserve(self.fft_size + cp_len)
            .map_err(|e| PhyError::AllocationFailure(format!("OFDM symbol: {}", e)))?;

        let scale = self.scale;
        let n = self.fft_size;
        let time = self.transform(spectrum)?;
        out.extend(time[n - cp_len..].iter().map(|&s| s * scale));
        out.extend(time.iter().map(|&s| s * scale));
        Ok(())
    }

    #[cfg(not(feature = "fftw"))]
    fn transform(&mut self, spectrum: &[Complex32]) -> Result<&[Complex32], PhyError> {
        self.buffer.copy_from_slice(spectrum);
        self.ifft.process(&mut self.buffer);
        Ok(&self.buffer[..])
    }

    #[cfg(feature = "fftw")]
    fn transform(&mut self, spectrum: &[Complex32]) -> Result<&[Complex32], PhyError> {
        self.ifft_input.copy_from_slice(spectrum);
        self.ifft_plan
            .c2c(&mut self.ifft_input, &mut self.ifft_output)
            .map_err(|e| PhyError::ProcessingError(format!("IFFT failed: {:?}", e)))?;
        Ok(&self.ifft_output[..])
    }
}

/// OFDM demodulator (FFT of the useful part)
pub struct OfdmDemodulator {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    scale: f32,
}

impl OfdmDemodulator {
    pub fn new(fft_size: usize) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        Self {
            fft_size,
            fft,
            scale: 1.0 / (fft_size as f32).sqrt(),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Transform `useful` (exactly one FFT length, CP already skipped) into `out`
    pub fn demodulate_into(&self, useful: &[Complex32], out: &mut [Complex32]) -> Result<(), PhyError> {
        if useful.len() != self.fft_size || out.len() != self.fft_size {
            return Err(PhyError::ProcessingError(format!(
                "Expected {} samples, got {} in / {} out",
                self.fft_size,
                useful.len(),
                out.len()
            )));
        }
        out.copy_from_slice(useful);
        self.fft.process(out);
        for s in out.iter_mut() {
            *s *= self.scale;
        }
        Ok(())
    }

    pub fn demodulate(&self, useful: &[Complex32]) -> Result<Vec<Complex32>, PhyError> {
        let mut out = crate::try_alloc(self.fft_size, Complex32::new(0.0, 0.0), "FFT output")?;
        self.demodulate_into(useful, &mut out)?;
        Ok(out)
    }
}

/// Rotate samples by `freq_hz`; `start_index` is the stream position of the
/// first sample so consecutive blocks stay phase continuous
pub fn apply_frequency_shift(samples: &mut [Complex32], freq_hz: f32, sample_rate: f64, start_index: u64) {
    if freq_hz == 0.0 {
        return;
    }
    let increment = 2.0 * PI * freq_hz as f64 / sample_rate;
    let mut phase = (increment * start_index as f64).rem_euclid(2.0 * PI);

    for sample in samples {
        *sample *= Complex32::new(phase.cos() as f32, phase.sin() as f32);
        phase += increment;

        // Wrap phase to [-π, π]
        if phase > PI {
            phase -= 2.0 * PI;
        } else if phase < -PI {
            phase += 2.0 * PI;
        }
    }
}

/// Remove a carrier frequency offset of `cfo_hz`
pub fn apply_cfo_correction(samples: &mut [Complex32], cfo_hz: f32, sample_rate: f64, start_index: u64) {
    apply_frequency_shift(samples, -cfo_hz, sample_rate, start_index);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcarrier_bin() {
        assert_eq!(subcarrier_bin(0, 128), 0);
        assert_eq!(subcarrier_bin(5, 128), 5);
        assert_eq!(subcarrier_bin(-1, 128), 127);
        assert_eq!(subcarrier_bin(-31, 128), 97);
    }

    #[test]
    fn test_modulate_demodulate() {
        let n = 128;
        let mut spectrum = vec![Complex32::new(0.0, 0.0); n];
        spectrum[3] = Complex32::new(1.0, 0.0);
        spectrum[subcarrier_bin(-7, n)] = Complex32::new(0.0, -1.0);

        let mut modulator = OfdmModulator::new(n).unwrap();
        let mut symbol = Vec::new();
        modulator.modulate_into(&spectrum, 9, &mut symbol).unwrap();
        assert_eq!(symbol.len(), n + 9);
        // CP repeats the tail
        for i in 0..9 {
            assert!((symbol[i] - symbol[n + i]).norm() < 1e-6);
        }

        let demodulator = OfdmDemodulator::new(n);
        let recovered = demodulator.demodulate(&symbol[9..]).unwrap();
        for (a, b) in recovered.iter().zip(spectrum.iter()) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn test_wrong_lengths() {
        let mut modulator = OfdmModulator::new(128).unwrap();
        let mut out = Vec::new();
        assert!(modulator.modulate_into(&[Complex32::new(0.0, 0.0); 64], 9, &mut out).is_err());
        let demodulator = OfdmDemodulator::new(128);
        assert!(demodulator.demodulate(&[Complex32::new(0.0, 0.0); 100]).is_err());
    }

    #[test]
    fn test_cfo_correction_continuity() {
        let fs = 1.92e6;
        let mut whole = vec![Complex32::new(1.0, 0.0); 1000];
        apply_frequency_shift(&mut whole, 1234.0, fs, 0);

        // Correct the second half separately, starting mid-stream
        let mut tail = whole[500..].to_vec();
        apply_cfo_correction(&mut tail, 1234.0, fs, 500);
        for s in tail {
            assert!((s - Complex32::new(1.0, 0.0)).norm() < 1e-3);
        }
    }
}
