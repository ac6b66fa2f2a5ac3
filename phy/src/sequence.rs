//! Primary and Secondary Synchronization Sequences
//!
//! Implements PSS/SSS generation according to 3GPP TS 36.211 section 6.11
//! and NPSS/NSSS generation according to section 10.2.7, plus the
//! time-domain reference kernels the correlator slides over the stream.

use crate::numerology::Numerology;
use crate::ofdm::{apply_frequency_shift, subcarrier_bin, OfdmModulator};
use crate::PhyError;
use common::types::{CyclicPrefix, Pci};
use num_complex::Complex32;
use std::f32::consts::PI;
use tracing::debug;

/// PSS sequence length
pub const PSS_LENGTH: usize = 62;

/// SSS sequence length
pub const SSS_LENGTH: usize = 62;

/// Length of the SSS m-sequences
pub const M_SEQ_LENGTH: usize = 31;

/// Zadoff-Chu roots indexed by N_id_2
pub const PSS_ROOTS: [u32; 3] = [25, 29, 34];

/// NPSS Zadoff-Chu root and length
pub const NPSS_ROOT: u32 = 5;
pub const NPSS_LENGTH: usize = 11;

/// NPSS occupies symbols 3..13 of subframe 5
pub const NPSS_FIRST_SYMBOL: usize = 3;
pub const NPSS_NUM_SYMBOLS: usize = 11;

/// NPSS cover code S(l), l = 3..13
pub const NPSS_COVER: [f32; NPSS_NUM_SYMBOLS] = [1.0, 1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0, -1.0, 1.0];

/// NSSS resource elements (11 symbols × 12 subcarriers)
pub const NSSS_LENGTH: usize = 132;

/// NSSS Zadoff-Chu length
pub const NSSS_ZC_LENGTH: usize = 131;

/// Subcarriers in the narrowband PRB
pub const NB_SUBCARRIERS: usize = 12;

/// Hadamard rows selected by q = N_id / 126
const NSSS_HADAMARD_ROWS: [usize; 4] = [0, 31, 63, 127];

/// Narrowband half-subcarrier shift
pub const NB_FREQ_SHIFT: f32 = 0.5;

/// Generate the PSS Zadoff-Chu sequence for N_id_2
pub fn pss_sequence(nid2: u8) -> Result<Vec<Complex32>, PhyError> {
    let u = *PSS_ROOTS.get(nid2 as usize).ok_or_else(|| {
        PhyError::InvalidConfig(format!("PSS variant {} out of range (0-2)", nid2))
    })? as f32;

    Ok((0..PSS_LENGTH)
        .map(|n| {
            let n = n as f32;
            let phase = if n < 31.0 {
                -PI * u * n * (n + 1.0) / 63.0
            } else {
                -PI * u * (n + 1.0) * (n + 2.0) / 63.0
            };
            Complex32::from_polar(1.0, phase)
        })
        .collect())
}

/// FFT bin carrying element `n` of a 62-element PSS/SSS sequence
pub fn pss_bin(n: usize, fft_size: usize) -> usize {
    if n < 31 {
        fft_size - 31 + n
    } else {
        n - 30
    }
}

/// FFT bin carrying narrowband subcarrier `k` (0..11)
pub fn nb_bin(k: usize, fft_size: usize) -> usize {
    subcarrier_bin(k as i32 - 6, fft_size)
}

/// The three length-31 m-sequences s̃, c̃ and z̃ in ±1 form
#[derive(Debug, Clone)]
pub struct MSequences {
    pub s: [f32; M_SEQ_LENGTH],
    pub c: [f32; M_SEQ_LENGTH],
    pub z: [f32; M_SEQ_LENGTH],
}

impl MSequences {
    pub fn new() -> Self {
        Self {
            s: m_sequence(|x, i| (x[i + 2] + x[i]) % 2),
            c: m_sequence(|x, i| (x[i + 3] + x[i]) % 2),
            z: m_sequence(|x, i| (x[i + 4] + x[i + 2] + x[i + 1] + x[i]) % 2),
        }
    }

    /// s̃((n + m) mod 31)
    pub fn s_shift(&self, m: usize, n: usize) -> f32 {
        self.s[(n + m) % M_SEQ_LENGTH]
    }

    /// c0(n) or, with `odd`, c1(n) for N_id_2
    pub fn c_scramble(&self, nid2: u8, odd: bool, n: usize) -> f32 {
        let shift = nid2 as usize + if odd { 3 } else { 0 };
        self.c[(n + shift) % M_SEQ_LENGTH]
    }

    /// z1^(m)(n) = z̃((n + (m mod 8)) mod 31)
    pub fn z_scramble(&self, m: usize, n: usize) -> f32 {
        self.z[(n + m % 8) % M_SEQ_LENGTH]
    }
}

impl Default for MSequences {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a 5-stage LFSR with x(0..4) = [0, 0, 0, 0, 1]
fn m_sequence(feedback: impl Fn(&[u8], usize) -> u8) -> [f32; M_SEQ_LENGTH] {
    let mut x = [0u8; M_SEQ_LENGTH + 5];
    x[4] = 1;
    for i in 0..M_SEQ_LENGTH {
        x[i + 5] = feedback(&x, i);
    }

    let mut seq = [0.0f32; M_SEQ_LENGTH];
    for (out, &bit) in seq.iter_mut().zip(x.iter()) {
        *out = 1.0 - 2.0 * bit as f32;
    }
    seq
}

/// (m0, m1) for a cell identity group
pub fn sss_m_indices(nid1: u16) -> (usize, usize) {
    let nid1 = nid1 as usize;
    let q_prime = nid1 / 30;
    let q = (nid1 + q_prime * (q_prime + 1) / 2) / 30;
    let m_prime = nid1 + q * (q + 1) / 2;
    let m0 = m_prime % 31;
    let m1 = (m0 + m_prime / 31 + 1) % 31;
    (m0, m1)
}

/// Generate the 62-element SSS for subframe 0 or 5
pub fn sss_sequence(
    mseq: &MSequences,
    nid1: u16,
    nid2: u8,
    subframe5: bool,
) -> Result<Vec<f32>, PhyError> {
    if nid1 >= Pci::NUM_GROUPS || nid2 >= Pci::NUM_SECTORS {
        return Err(PhyError::InvalidConfig(format!(
            "SSS identity out of range: N_id_1={} N_id_2={}",
            nid1, nid2
        )));
    }

    let (m0, m1) = sss_m_indices(nid1);
    // The even half carries the shift that also selects z1
    let (even_m, odd_m) = if subframe5 { (m1, m0) } else { (m0, m1) };

    let mut seq = vec![0.0f32; SSS_LENGTH];
    for n in 0..M_SEQ_LENGTH {
        seq[2 * n] = mseq.s_shift(even_m, n) * mseq.c_scramble(nid2, false, n);
        seq[2 * n + 1] = mseq.s_shift(odd_m, n) * mseq.c_scramble(nid2, true, n) * mseq.z_scramble(even_m, n);
    }
    Ok(seq)
}

/// NPSS elements for each of the 11 symbols
pub fn npss_sequence() -> Vec<Vec<Complex32>> {
    let u = NPSS_ROOT as f32;
    let base: Vec<Complex32> = (0..NPSS_LENGTH)
        .map(|n| {
            let n = n as f32;
            Complex32::from_polar(1.0, -PI * u * n * (n + 1.0) / NPSS_LENGTH as f32)
        })
        .collect();

    NPSS_COVER
        .iter()
        .map(|&s| base.iter().map(|&d| d * s).collect())
        .collect()
}

/// Sylvester-Hadamard row `row` of order 128, element `m`
pub fn hadamard(row: usize, m: usize) -> f32 {
    if (row & m).count_ones() % 2 == 0 {
        1.0
    } else {
        -1.0
    }
}

/// Generate the 132-element NSSS for N_id_ncell and ⌊nf/2⌋ mod 4
pub fn nsss_sequence(n_id: u16, frame_mod: u8) -> Result<Vec<Complex32>, PhyError> {
    if n_id > Pci::MAX || frame_mod > 3 {
        return Err(PhyError::InvalidConfig(format!(
            "NSSS identity out of range: N_id={} frame={}",
            n_id, frame_mod
        )));
    }

    let u = (n_id % 126 + 3) as f32;
    let row = NSSS_HADAMARD_ROWS[(n_id / 126) as usize];
    let theta = 33.0 / 132.0 * frame_mod as f32;
    let zc_len = NSSS_ZC_LENGTH as f32;

    Ok((0..NSSS_LENGTH)
        .map(|n| {
            let n_prime = (n % NSSS_ZC_LENGTH) as f32;
            let b = hadamard(row, n % 128);
            let shift = -2.0 * PI * theta * n as f32;
            let zc = -PI * u * n_prime * (n_prime + 1.0) / zc_len;
            Complex32::from_polar(b, shift + zc)
        })
        .collect())
}

/// Turn per-symbol spectra into a contiguous time-domain block
///
/// Each symbol gets its CP prepended; a non-zero `freq_shift` (in
/// subcarriers) rotates the whole block by exp(j2π·shift·n/N).
pub fn generate_kernel(
    spectra: &[Vec<Complex32>],
    fft_size: usize,
    cp_table: &[usize],
    freq_shift: f32,
) -> Result<Vec<Complex32>, PhyError> {
    if spectra.len() != cp_table.len() {
        return Err(PhyError::InvalidConfig(format!(
            "{} symbols but {} CP lengths",
            spectra.len(),
            cp_table.len()
        )));
    }
    if let Some(&bad) = cp_table.iter().find(|&&cp| cp == 0 || cp > fft_size / 4) {
        return Err(PhyError::InvalidConfig(format!(
            "CP length {} outside 1..={}",
            bad,
            fft_size / 4
        )));
    }

    let total: usize = cp_table.iter().map(|cp| cp + fft_size).sum();
    let mut samples = Vec::new();
    samples
        .try_reserve_exact(total)
        .map_err(|e| PhyError::AllocationFailure(format!("kernel of {} samples: {}", total, e)))?;

    let mut modulator = OfdmModulator::new(fft_size)?;
    for (spectrum, &cp) in spectra.iter().zip(cp_table.iter()) {
        modulator.modulate_into(spectrum, cp, &mut samples)?;
    }

    if freq_shift != 0.0 {
        apply_frequency_shift(&mut samples, freq_shift * 15_000.0, fft_size as f64 * 15_000.0, 0);
    }

    Ok(samples)
}

/// Place a 62-element sequence on the subcarriers around DC
pub fn map_centered(seq: &[Complex32], fft_size: usize) -> Vec<Complex32> {
    let mut spectrum = vec![Complex32::new(0.0, 0.0); fft_size];
    for (n, &d) in seq.iter().enumerate() {
        spectrum[pss_bin(n, fft_size)] = d;
    }
    spectrum
}

/// Place up to 12 elements on the narrowband PRB
pub fn map_narrowband(seq: &[Complex32], fft_size: usize) -> Vec<Complex32> {
    let mut spectrum = vec![Complex32::new(0.0, 0.0); fft_size];
    for (k, &d) in seq.iter().enumerate() {
        spectrum[nb_bin(k, fft_size)] = d;
    }
    spectrum
}

/// Time-domain reference waveform of a synchronization signal
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceKernel {
    variant: u8,
    fft_size: usize,
    samples: Vec<Complex32>,
    symbol_cps: Vec<usize>,
    first_symbol: usize,
}

impl ReferenceKernel {
    /// LTE PSS kernel for N_id_2
    ///
    /// Carries the short normal CP, which is also the tail of an extended
    /// CP, so one kernel matches both CP types.
    pub fn pss(nid2: u8, numerology: &Numerology) -> Result<Self, PhyError> {
        let fft_size = numerology.fft_size();
        let spectrum = map_centered(&pss_sequence(nid2)?, fft_size);
        let symbol = CyclicPrefix::Normal.symbols_per_slot() - 1;
        let cp = numerology.cp_len(CyclicPrefix::Normal, symbol);
        let samples = generate_kernel(&[spectrum], fft_size, &[cp], 0.0)?;

        debug!("Generated PSS kernel N_id_2={} ({} samples)", nid2, samples.len());
        Ok(Self {
            variant: nid2,
            fft_size,
            samples,
            symbol_cps: vec![cp],
            first_symbol: symbol,
        })
    }

    /// NB-IoT NPSS kernel (11 symbols of subframe 5)
    pub fn npss(numerology: &Numerology) -> Result<Self, PhyError> {
        let fft_size = numerology.fft_size();
        let spectra: Vec<Vec<Complex32>> = npss_sequence()
            .iter()
            .map(|sym| map_narrowband(sym, fft_size))
            .collect();
        let cps = nb_cp_table(numerology);
        let samples = generate_kernel(&spectra, fft_size, &cps, NB_FREQ_SHIFT)?;

        debug!("Generated NPSS kernel ({} samples)", samples.len());
        Ok(Self {
            variant: 0,
            fft_size,
            samples,
            symbol_cps: cps,
            first_symbol: NPSS_FIRST_SYMBOL,
        })
    }

    /// NB-IoT NSSS block (11 symbols of subframe 9)
    pub fn nsss(n_id: u16, frame_mod: u8, numerology: &Numerology) -> Result<Self, PhyError> {
        let fft_size = numerology.fft_size();
        let seq = nsss_sequence(n_id, frame_mod)?;
        let spectra: Vec<Vec<Complex32>> = seq
            .chunks(NB_SUBCARRIERS)
            .map(|sym| map_narrowband(sym, fft_size))
            .collect();
        let cps = nb_cp_table(numerology);
        let samples = generate_kernel(&spectra, fft_size, &cps, NB_FREQ_SHIFT)?;

        Ok(Self {
            variant: 0,
            fft_size,
            samples,
            symbol_cps: cps,
            first_symbol: NPSS_FIRST_SYMBOL,
        })
    }

    pub fn variant(&self) -> u8 {
        self.variant
    }

    pub fn samples(&self) -> &[Complex32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn symbol_cps(&self) -> &[usize] {
        &self.symbol_cps
    }

    /// Symbol index of the first kernel symbol within its subframe
    pub fn first_symbol(&self) -> usize {
        self.first_symbol
    }

    pub fn num_symbols(&self) -> usize {
        self.symbol_cps.len()
    }

    /// Offset of the useful part of kernel symbol `i`
    pub fn useful_start(&self, i: usize) -> usize {
        self.symbol_cps[..i].iter().map(|cp| cp + self.fft_size).sum::<usize>() + self.symbol_cps[i]
    }

    /// Offset of the sync anchor (useful part of the first symbol)
    pub fn anchor(&self) -> usize {
        self.symbol_cps[0]
    }

    pub fn energy(&self) -> f32 {
        self.samples.iter().map(|s| s.norm_sqr()).sum()
    }
}

/// Normal CP lengths of narrowband symbols 3..13
fn nb_cp_table(numerology: &Numerology) -> Vec<usize> {
    (NPSS_FIRST_SYMBOL..NPSS_FIRST_SYMBOL + NPSS_NUM_SYMBOLS)
        .map(|l| numerology.cp_len(CyclicPrefix::Normal, l))
        .collect()
}
