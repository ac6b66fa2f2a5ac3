//! Secondary Synchronization Sequence Resolution
//!
//! Recovers the cell identity group and half-frame parity from the SSS
//! (LTE) or the identity and frame position from the NSSS (NB-IoT), given
//! the anchor found by the primary-sequence search.

use crate::numerology::Numerology;
use crate::ofdm::{apply_cfo_correction, apply_frequency_shift, OfdmDemodulator};
use crate::sequence::{
    nb_bin, nsss_sequence, pss_bin, pss_sequence, MSequences, ReferenceKernel, M_SEQ_LENGTH,
    NB_FREQ_SHIFT, NB_SUBCARRIERS, NSSS_LENGTH, SSS_LENGTH,
};
use crate::PhyError;
use common::types::{CyclicPrefix, DuplexMode, Pci};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Minimum normalized NSSS correlation for a detection
pub const NSSS_MIN_METRIC: f32 = 0.4;

/// Segment boundaries for the partial strategy
const PARTIAL_SEGMENTS: [(usize, usize); 3] = [(0, 10), (10, 20), (20, 31)];

/// Candidates kept per half in the (m0, m1) search
const TOP_CANDIDATES: usize = 2;

/// SSS correlation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SssStrategy {
    /// Coherent sum over all 31 elements
    #[default]
    Full,
    /// Non-coherent sum of three coherent segments
    Partial,
    /// Adjacent-element products against the differential table
    Differential,
}

/// Resolved secondary sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SssDetection {
    /// N_id_1 (LTE) or N_id_ncell (NB-IoT)
    pub group_id: u16,
    /// 0/1 for SSS of subframe 0/5 (LTE), ⌊nf/2⌋ mod 4 (NB-IoT)
    pub parity: u8,
    /// Normalized correlation metric in [0, 1]
    pub metric: f32,
}

/// Outcome of a secondary-sequence search
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SssResolution {
    Resolved(SssDetection),
    Unresolved,
}

impl SssResolution {
    pub fn metric(&self) -> f32 {
        match self {
            SssResolution::Resolved(d) => d.metric,
            SssResolution::Unresolved => 0.0,
        }
    }

    pub fn detection(&self) -> Option<SssDetection> {
        match self {
            SssResolution::Resolved(d) => Some(*d),
            SssResolution::Unresolved => None,
        }
    }
}

/// LTE SSS resolver
pub struct SssResolver {
    numerology: Numerology,
    strategy: SssStrategy,
    equalize: bool,
    mseq: MSequences,
    /// s_table[m][n] = s̃((n + m) mod 31)
    s_table: [[f32; M_SEQ_LENGTH]; M_SEQ_LENGTH],
    /// sd_table[m][n] = s_table[m][n + 1] · s_table[m][n]
    sd_table: [[f32; M_SEQ_LENGTH - 1]; M_SEQ_LENGTH],
    /// (m0, m1) → N_id_1
    pair_table: [[Option<u16>; M_SEQ_LENGTH]; M_SEQ_LENGTH],
    pss: Vec<Vec<Complex32>>,
    demod: OfdmDemodulator,
}

impl SssResolver {
    pub fn new(numerology: Numerology, strategy: SssStrategy, equalize: bool) -> Result<Self, PhyError> {
        let mseq = MSequences::new();

        let mut s_table = [[0.0f32; M_SEQ_LENGTH]; M_SEQ_LENGTH];
        let mut sd_table = [[0.0f32; M_SEQ_LENGTH - 1]; M_SEQ_LENGTH];
        for m in 0..M_SEQ_LENGTH {
            for n in 0..M_SEQ_LENGTH {
                s_table[m][n] = mseq.s_shift(m, n);
            }
            for n in 0..M_SEQ_LENGTH - 1 {
                sd_table[m][n] = s_table[m][n + 1] * s_table[m][n];
            }
        }

        let mut pair_table = [[None; M_SEQ_LENGTH]; M_SEQ_LENGTH];
        for nid1 in 0..Pci::NUM_GROUPS {
            let (m0, m1) = crate::sequence::sss_m_indices(nid1);
            pair_table[m0][m1] = Some(nid1);
        }

        let pss = (0..Pci::NUM_SECTORS)
            .map(pss_sequence)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            numerology,
            strategy,
            equalize,
            mseq,
            s_table,
            sd_table,
            pair_table,
            pss,
            demod: OfdmDemodulator::new(numerology.fft_size()),
        })
    }

    /// Resolve the SSS for a PSS whose useful part starts at `anchor`
    pub fn resolve(
        &self,
        buffer: &[Complex32],
        anchor: usize,
        nid2: u8,
        duplex: DuplexMode,
        cp: CyclicPrefix,
        cfo_hz: f32,
    ) -> Result<SssResolution, PhyError> {
        let n = self.numerology.fft_size();
        let distance = self.numerology.pss_sss_distance(duplex, cp);
        if anchor < distance || anchor + n > buffer.len() || nid2 as usize >= self.pss.len() {
            return Ok(SssResolution::Unresolved);
        }
        let sss_start = anchor - distance;

        let mut sss_time = buffer[sss_start..sss_start + n].to_vec();
        let mut pss_time = buffer[anchor..anchor + n].to_vec();
        if cfo_hz.is_finite() && cfo_hz != 0.0 {
            let fs = self.numerology.sample_rate();
            apply_cfo_correction(&mut sss_time, cfo_hz, fs, 0);
            apply_cfo_correction(&mut pss_time, cfo_hz, fs, distance as u64);
        }

        let sss_bins = self.demod.demodulate(&sss_time)?;
        let mut y: Vec<Complex32> = (0..SSS_LENGTH).map(|i| sss_bins[pss_bin(i, n)]).collect();

        if self.equalize {
            let pss_bins = self.demod.demodulate(&pss_time)?;
            for (i, yi) in y.iter_mut().enumerate() {
                let h = pss_bins[pss_bin(i, n)] * self.pss[nid2 as usize][i].conj();
                *yi *= h.conj();
            }
        }

        Ok(self.resolve_sequence(&y, nid2))
    }

    /// Resolve from the 62 SSS subcarriers (DC-centered order)
    pub fn resolve_sequence(&self, y: &[Complex32], nid2: u8) -> SssResolution {
        if y.len() != SSS_LENGTH {
            return SssResolution::Unresolved;
        }

        let mut even = [Complex32::new(0.0, 0.0); M_SEQ_LENGTH];
        let mut odd = [Complex32::new(0.0, 0.0); M_SEQ_LENGTH];
        for i in 0..M_SEQ_LENGTH {
            even[i] = y[2 * i] * self.mseq.c_scramble(nid2, false, i);
            odd[i] = y[2 * i + 1] * self.mseq.c_scramble(nid2, true, i);
        }

        let even_metrics = self.shift_metrics(&even);
        let mut best: Option<(f32, u16, u8)> = None;

        for &a in top_indices(&even_metrics).iter() {
            let mut odd_desc = odd;
            for (i, v) in odd_desc.iter_mut().enumerate() {
                *v *= self.mseq.z_scramble(a, i);
            }
            let odd_metrics = self.shift_metrics(&odd_desc);

            for &b in top_indices(&odd_metrics).iter() {
                if a == b {
                    continue;
                }
                let (m0, m1, parity) = if a < b { (a, b, 0) } else { (b, a, 1) };
                let Some(nid1) = self.pair_table[m0][m1] else {
                    continue;
                };
                let score = 0.5 * (even_metrics[a] + odd_metrics[b]);
                trace!("SSS candidate m0={} m1={} N_id_1={} score {:.3}", m0, m1, nid1, score);
                if best.map_or(true, |(s, _, _)| score > s) {
                    best = Some((score, nid1, parity));
                }
            }
        }

        match best {
            Some((metric, group_id, parity)) => SssResolution::Resolved(SssDetection {
                group_id,
                parity,
                metric,
            }),
            None => SssResolution::Unresolved,
        }
    }

    /// Normalized metric of every cyclic shift for one descrambled half
    fn shift_metrics(&self, x: &[Complex32; M_SEQ_LENGTH]) -> [f32; M_SEQ_LENGTH] {
        let mut metrics = [0.0f32; M_SEQ_LENGTH];
        match self.strategy {
            SssStrategy::Full => {
                let energy: f32 = x.iter().map(|v| v.norm_sqr()).sum();
                if energy > 0.0 {
                    for (m, out) in metrics.iter_mut().enumerate() {
                        let acc: Complex32 = x.iter().zip(self.s_table[m].iter()).map(|(v, &s)| v * s).sum();
                        *out = acc.norm_sqr() / (M_SEQ_LENGTH as f32 * energy);
                    }
                }
            }
            SssStrategy::Partial => {
                let energy: f32 = x.iter().map(|v| v.norm_sqr()).sum();
                let seg_norm: f32 = PARTIAL_SEGMENTS
                    .iter()
                    .map(|(lo, hi)| ((hi - lo) * (hi - lo)) as f32)
                    .sum::<f32>()
                    / M_SEQ_LENGTH as f32;
                if energy > 0.0 {
                    for (m, out) in metrics.iter_mut().enumerate() {
                        let total: f32 = PARTIAL_SEGMENTS
                            .iter()
                            .map(|&(lo, hi)| {
                                x[lo..hi]
                                    .iter()
                                    .zip(self.s_table[m][lo..hi].iter())
                                    .map(|(v, &s)| v * s)
                                    .sum::<Complex32>()
                                    .norm_sqr()
                            })
                            .sum();
                        *out = total / (seg_norm * energy);
                    }
                }
            }
            SssStrategy::Differential => {
                let mut p = [Complex32::new(0.0, 0.0); M_SEQ_LENGTH - 1];
                for (i, out) in p.iter_mut().enumerate() {
                    *out = x[i + 1] * x[i].conj();
                }
                let energy: f32 = p.iter().map(|v| v.norm_sqr()).sum();
                if energy > 0.0 {
                    for (m, out) in metrics.iter_mut().enumerate() {
                        let acc: Complex32 = p.iter().zip(self.sd_table[m].iter()).map(|(v, &s)| v * s).sum();
                        *out = acc.norm_sqr() / ((M_SEQ_LENGTH - 1) as f32 * energy);
                    }
                }
            }
        }
        metrics
    }
}

/// Indices of the largest entries, best first
fn top_indices(metrics: &[f32; M_SEQ_LENGTH]) -> [usize; TOP_CANDIDATES] {
    let mut order: Vec<usize> = (0..M_SEQ_LENGTH).collect();
    order.sort_by(|&a, &b| metrics[b].total_cmp(&metrics[a]));
    let mut top = [0usize; TOP_CANDIDATES];
    top.copy_from_slice(&order[..TOP_CANDIDATES]);
    top
}

/// NB-IoT NSSS resolver
pub struct NsssResolver {
    numerology: Numerology,
    /// Conjugated candidates, index 4·N_id + frame_mod
    candidates: Vec<Vec<Complex32>>,
    /// Layout of the 11-symbol block
    block: ReferenceKernel,
    demod: OfdmDemodulator,
}

impl NsssResolver {
    pub fn new(numerology: Numerology) -> Result<Self, PhyError> {
        let mut candidates = Vec::new();
        candidates
            .try_reserve_exact(4 * (Pci::MAX as usize + 1))
            .map_err(|e| PhyError::AllocationFailure(format!("NSSS table: {}", e)))?;
        for n_id in 0..=Pci::MAX {
            for frame_mod in 0..4u8 {
                let seq = nsss_sequence(n_id, frame_mod)?;
                candidates.push(seq.iter().map(|d| d.conj()).collect());
            }
        }

        Ok(Self {
            numerology,
            candidates,
            block: ReferenceKernel::nsss(0, 0, &numerology)?,
            demod: OfdmDemodulator::new(numerology.fft_size()),
        })
    }

    /// Length of the NSSS block in samples
    pub fn block_len(&self) -> usize {
        self.block.len()
    }

    /// Resolve the NSSS block starting (first CP sample of symbol 3) at `start`
    pub fn resolve(&self, buffer: &[Complex32], start: usize, cfo_hz: f32) -> Result<SssResolution, PhyError> {
        let len = self.block.len();
        if start + len > buffer.len() {
            return Ok(SssResolution::Unresolved);
        }

        let fs = self.numerology.sample_rate();
        let mut block = buffer[start..start + len].to_vec();
        if cfo_hz.is_finite() && cfo_hz != 0.0 {
            apply_cfo_correction(&mut block, cfo_hz, fs, 0);
        }
        apply_frequency_shift(&mut block, -NB_FREQ_SHIFT * 15_000.0, fs, 0);

        let n = self.numerology.fft_size();
        let mut res = Vec::with_capacity(NSSS_LENGTH);
        for i in 0..self.block.num_symbols() {
            let u = self.block.useful_start(i);
            let bins = self.demod.demodulate(&block[u..u + n])?;
            res.extend((0..NB_SUBCARRIERS).map(|k| bins[nb_bin(k, n)]));
        }

        Ok(self.resolve_elements(&res))
    }

    /// Resolve from the 132 NSSS resource elements
    pub fn resolve_elements(&self, res: &[Complex32]) -> SssResolution {
        if res.len() != NSSS_LENGTH {
            return SssResolution::Unresolved;
        }
        let energy: f32 = res.iter().map(|v| v.norm_sqr()).sum();
        if !(energy > 0.0) {
            return SssResolution::Unresolved;
        }

        let mut best = (0.0f32, 0usize);
        for (idx, cand) in self.candidates.iter().enumerate() {
            let acc: Complex32 = res.iter().zip(cand.iter()).map(|(r, c)| r * c).sum();
            let metric = acc.norm_sqr() / (NSSS_LENGTH as f32 * energy);
            if metric > best.0 {
                best = (metric, idx);
            }
        }

        let (metric, idx) = best;
        trace!("NSSS best N_id={} frame_mod={} metric {:.3}", idx / 4, idx % 4, metric);
        if metric < NSSS_MIN_METRIC {
            return SssResolution::Unresolved;
        }
        SssResolution::Resolved(SssDetection {
            group_id: (idx / 4) as u16,
            parity: (idx % 4) as u8,
            metric,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{map_centered, sss_sequence};
    use crate::ofdm::OfdmModulator;

    fn lte_sss(mseq: &MSequences, nid1: u16, nid2: u8, subframe5: bool) -> Vec<Complex32> {
        sss_sequence(mseq, nid1, nid2, subframe5)
            .unwrap()
            .iter()
            .map(|&v| Complex32::new(v, 0.0))
            .collect()
    }

    #[test]
    fn test_all_identities_all_strategies() {
        let num = Numerology::new(128).unwrap();
        let mseq = MSequences::new();
        let channel = Complex32::from_polar(0.7, 1.1);

        for strategy in [SssStrategy::Full, SssStrategy::Partial, SssStrategy::Differential] {
            let resolver = SssResolver::new(num, strategy, false).unwrap();
            for nid2 in 0..3u8 {
                for nid1 in 0..168u16 {
                    for subframe5 in [false, true] {
                        let y: Vec<Complex32> = lte_sss(&mseq, nid1, nid2, subframe5)
                            .iter()
                            .map(|&v| v * channel)
                            .collect();
                        let det = resolver.resolve_sequence(&y, nid2).detection().unwrap_or_else(|| {
                            panic!("{:?} failed N_id_1={} N_id_2={}", strategy, nid1, nid2)
                        });
                        assert_eq!(det.group_id, nid1, "{:?} N_id_2={}", strategy, nid2);
                        assert_eq!(det.parity, subframe5 as u8);
                        assert!(det.metric > 0.99);
                    }
                }
            }
        }
    }

    #[test]
    fn test_time_domain_resolution() {
        let num = Numerology::new(128).unwrap();
        let mseq = MSequences::new();
        let n = 128;
        let (nid1, nid2) = (97u16, 2u8);

        // SSS symbol followed by PSS symbol, FDD normal CP layout
        let mut modulator = OfdmModulator::new(n).unwrap();
        let mut buffer = vec![Complex32::new(0.0, 0.0); 50];
        modulator
            .modulate_into(&map_centered(&lte_sss(&mseq, nid1, nid2, true), n), 9, &mut buffer)
            .unwrap();
        modulator
            .modulate_into(&map_centered(&pss_sequence(nid2).unwrap(), n), 9, &mut buffer)
            .unwrap();
        buffer.extend(std::iter::repeat(Complex32::new(0.0, 0.0)).take(50));
        let anchor = 50 + 137 + 9;

        let resolver = SssResolver::new(num, SssStrategy::Full, true).unwrap();
        let res = resolver
            .resolve(&buffer, anchor, nid2, DuplexMode::Fdd, CyclicPrefix::Normal, 0.0)
            .unwrap();
        let det = res.detection().unwrap();
        assert_eq!(det.group_id, nid1);
        assert_eq!(det.parity, 1);

        // TDD hypothesis reaches before the buffer start
        let res = resolver
            .resolve(&buffer, anchor, nid2, DuplexMode::Tdd, CyclicPrefix::Normal, 0.0)
            .unwrap();
        assert_eq!(res, SssResolution::Unresolved);

        // Anchor past the end
        let res = resolver
            .resolve(&buffer, buffer.len(), nid2, DuplexMode::Fdd, CyclicPrefix::Normal, 0.0)
            .unwrap();
        assert_eq!(res, SssResolution::Unresolved);
    }

    #[test]
    fn test_resolvers_agree_with_noise() {
        use rand::rngs::StdRng;
        use rand::SeedableRng;
        use rand_distr::{Distribution, Normal};

        let num = Numerology::new(128).unwrap();
        let mseq = MSequences::new();
        let mut rng = StdRng::seed_from_u64(99);
        let noise = Normal::new(0.0f32, 0.15).unwrap();

        let resolvers: Vec<SssResolver> = [SssStrategy::Full, SssStrategy::Partial, SssStrategy::Differential]
            .iter()
            .map(|&s| SssResolver::new(num, s, false).unwrap())
            .collect();

        for (nid1, nid2) in [(0u16, 0u8), (61, 1), (167, 2), (120, 0)] {
            let y: Vec<Complex32> = lte_sss(&mseq, nid1, nid2, false)
                .iter()
                .map(|&v| v + Complex32::new(noise.sample(&mut rng), noise.sample(&mut rng)))
                .collect();
            for resolver in &resolvers {
                let det = resolver.resolve_sequence(&y, nid2).detection().unwrap();
                assert_eq!(det.group_id, nid1);
                assert_eq!(det.parity, 0);
            }
        }
    }

    #[test]
    fn test_nsss_resolution() {
        let num = Numerology::new(128).unwrap();
        let resolver = NsssResolver::new(num).unwrap();

        for (n_id, frame_mod) in [(0u16, 0u8), (17, 3), (300, 1), (503, 2)] {
            let block = ReferenceKernel::nsss(n_id, frame_mod, &num).unwrap();
            let mut buffer = vec![Complex32::new(0.0, 0.0); 40];
            buffer.extend_from_slice(block.samples());
            let res = resolver.resolve(&buffer, 40, 0.0).unwrap();
            let det = res.detection().unwrap();
            assert_eq!(det.group_id, n_id);
            assert_eq!(det.parity, frame_mod);
            assert!(det.metric > 0.95);
        }

        // Empty block does not clear the threshold
        let zeros = vec![Complex32::new(0.0, 0.0); resolver.block_len()];
        assert_eq!(resolver.resolve(&zeros, 0, 0.0).unwrap(), SssResolution::Unresolved);
        assert_eq!(resolver.resolve(&zeros, 1, 0.0).unwrap(), SssResolution::Unresolved);
    }
}
