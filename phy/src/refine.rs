//! Frequency and Timing Refinement
//!
//! Carrier frequency offset estimation from the detected sync signal and
//! cyclic prefix classification around the sync anchor.

use crate::numerology::Numerology;
use crate::sequence::ReferenceKernel;
use common::types::{CyclicPrefix, DuplexMode};
use num_complex::Complex32;
use std::f32::consts::PI;
use tracing::trace;

pub use crate::ofdm::apply_cfo_correction;

/// Number of symbols preceding the anchor used for CP classification
pub const CP_DETECT_SYMBOLS: usize = 3;

/// CFO from two sample blocks `spacing_s` seconds apart
///
/// Returns arg(Σ a·conj(b)) / (2π·spacing) in Hz, or NaN when the inputs
/// carry no usable phase.
pub fn estimate_cfo(a: &[Complex32], b: &[Complex32], spacing_s: f32) -> f32 {
    if !(spacing_s > 0.0) || a.is_empty() || a.len() != b.len() {
        return f32::NAN;
    }

    let acc: Complex32 = a.iter().zip(b.iter()).map(|(x, y)| x * y.conj()).sum();
    if !acc.re.is_finite() || !acc.im.is_finite() || acc.norm_sqr() == 0.0 {
        return f32::NAN;
    }

    acc.arg() / (2.0 * PI * spacing_s)
}

/// CFO of the sync signal found at `start` (kernel start) in `buffer`
///
/// Works on the per-sample products r·conj(k). Single-symbol kernels (PSS)
/// compare the two halves of the useful part; multi-symbol kernels (NPSS)
/// compare consecutive symbols with equal spacing.
pub fn kernel_cfo(buffer: &[Complex32], start: usize, kernel: &ReferenceKernel, sample_rate: f64) -> f32 {
    let k = kernel.samples();
    if start + k.len() > buffer.len() {
        return f32::NAN;
    }

    let products: Vec<Complex32> = buffer[start..start + k.len()]
        .iter()
        .zip(k.iter())
        .map(|(r, s)| r * s.conj())
        .collect();

    let n = kernel.fft_size();
    let mut a = Vec::new();
    let mut b = Vec::new();

    let spacing = if kernel.num_symbols() == 1 {
        let u = kernel.useful_start(0);
        let half = n / 2;
        a.extend_from_slice(&products[u + half..u + n]);
        b.extend_from_slice(&products[u..u + n - half]);
        half
    } else {
        let cps = kernel.symbol_cps();
        let spacing = n + cps[1];
        for i in 0..kernel.num_symbols() - 1 {
            if n + cps[i + 1] != spacing {
                continue;
            }
            let ua = kernel.useful_start(i + 1);
            let ub = kernel.useful_start(i);
            a.extend_from_slice(&products[ua..ua + n]);
            b.extend_from_slice(&products[ub..ub + n]);
        }
        spacing
    };

    estimate_cfo(&a, &b, (spacing as f64 / sample_rate) as f32)
}

/// Exponential average of per-window CFO estimates
#[derive(Debug, Clone)]
pub struct CfoTracker {
    alpha: f32,
    value: Option<f32>,
}

impl CfoTracker {
    pub fn new(alpha: f32) -> Self {
        Self { alpha, value: None }
    }

    /// Fold a new estimate in; NaN leaves the state untouched
    pub fn update(&mut self, estimate_hz: f32) -> Option<f32> {
        if estimate_hz.is_nan() {
            return self.value;
        }
        self.value = Some(match self.value {
            Some(v) => self.alpha * estimate_hz + (1.0 - self.alpha) * v,
            None => estimate_hz,
        });
        self.value
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// CP correlation metrics for both hypotheses
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpMetrics {
    pub normal: f32,
    pub extended: f32,
}

impl CpMetrics {
    /// Higher metric wins; ties go to normal CP
    pub fn decision(&self) -> CyclicPrefix {
        if self.extended > self.normal {
            CyclicPrefix::Extended
        } else {
            CyclicPrefix::Normal
        }
    }
}

/// CP-vs-tail correlation R/C over the symbols preceding `anchor`
///
/// `cp_lens[0]` is the CP of the symbol whose useful part starts at
/// `anchor`, `cp_lens[k]` that of the k-th symbol before it. Symbols that
/// would start before the buffer are skipped.
pub fn cp_metric(buffer: &[Complex32], anchor: usize, fft_size: usize, cp_lens: &[usize]) -> f32 {
    let mut r_total = 0.0f32;
    let mut c_total = 0.0f32;

    let Some((&own_cp, preceding)) = cp_lens.split_first() else {
        return 0.0;
    };
    let mut back = own_cp;
    for &cp_len in preceding {
        back += fft_size + cp_len;
        if back > anchor {
            break;
        }
        let start = anchor - back;
        if start + fft_size + cp_len > buffer.len() {
            continue;
        }
        let cp = &buffer[start..start + cp_len];
        let tail = &buffer[start + fft_size..start + fft_size + cp_len];

        let r: Complex32 = cp.iter().zip(tail.iter()).map(|(x, y)| x * y.conj()).sum();
        let e_cp: f32 = cp.iter().map(|s| s.norm_sqr()).sum();
        let e_tail: f32 = tail.iter().map(|s| s.norm_sqr()).sum();

        r_total += r.norm();
        c_total += 0.5 * (e_cp + e_tail);
    }

    if c_total > 0.0 {
        r_total / c_total
    } else {
        0.0
    }
}

/// Classify the cyclic prefix around a PSS anchor (useful-part start)
/// laid out for `duplex`
pub fn classify_cp(buffer: &[Complex32], anchor: usize, numerology: &Numerology, duplex: DuplexMode) -> CpMetrics {
    let n = numerology.fft_size();
    let lookback = |cp| numerology.pss_lookback_cp(duplex, cp, CP_DETECT_SYMBOLS);
    let normal = cp_metric(buffer, anchor, n, &lookback(CyclicPrefix::Normal));
    let extended = cp_metric(buffer, anchor, n, &lookback(CyclicPrefix::Extended));
    trace!(
        "CP metrics at {} ({:?}): normal {:.3} extended {:.3}",
        anchor,
        duplex,
        normal,
        extended
    );
    CpMetrics { normal, extended }
}
