//! Synthetic Downlink
//!
//! Deterministic LTE / NB-IoT downlink generator used as a sample source
//! for the CLI and the tests. Frames carry the synchronization signals and,
//! for LTE, a loopback broadcast block in subframe 0: MIB, the frame
//! position inside the 40 ms period and a CRC-16, sent with differential
//! BPSK on the 48 subcarriers around DC of slot 1 symbols 0..3. The matching
//! [`LoopbackBchDecoder`] stands in for a real PBCH decoder.

use crate::config::RadioProfile;
use crate::mib::{Mib, MIB_BITS};
use crate::numerology::{Numerology, SUBFRAMES_PER_FRAME, SUBFRAMES_PER_HALF_FRAME};
use crate::ofdm::{apply_frequency_shift, subcarrier_bin, OfdmDemodulator, OfdmModulator};
use crate::sequence::{
    nb_bin, npss_sequence, nsss_sequence, pss_bin, pss_sequence, sss_sequence, MSequences, NB_FREQ_SHIFT,
    NB_SUBCARRIERS, NPSS_FIRST_SYMBOL, NPSS_LENGTH, PSS_LENGTH,
};
use crate::{BchOutcome, BroadcastDecoder, CellParams, PhyError};
use common::types::{CyclicPrefix, DlBandwidth, DuplexMode, Pci};
use common::utils::{crc16_bits, db_to_amplitude, pack_bits, push_bits, read_bits};
use interfaces::rf::{check_buffers, GainHandle, RfError, RfFrontend};
use ndarray::Array2;
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

/// Broadcast block symbols (slot 1, symbols 0..3)
pub const BCH_SYMBOLS: usize = 4;

/// Subcarriers per broadcast symbol (±1..±24)
pub const BCH_SUBCARRIERS: usize = 48;

/// MIB + frame offset + CRC-16
pub const BCH_PAYLOAD_BITS: usize = MIB_BITS + 2 + 16;

/// Reported SNR ceiling in dB
pub const BCH_MAX_SNR_DB: f32 = 60.0;

/// Synthetic downlink parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthConfig {
    pub profile: RadioProfile,
    pub fft_size: usize,
    /// Physical cell identity (0..503)
    pub pci: u16,
    pub cp: CyclicPrefix,
    pub duplex: DuplexMode,
    /// Carrier frequency offset applied to the stream
    pub cfo_hz: f32,
    /// SNR relative to the primary sync symbol power, `None` for no noise
    pub snr_db: Option<f32>,
    pub seed: u64,
    /// Signal samples skipped before the stream starts
    pub sample_offset: usize,
    /// SFN of the first generated frame
    pub start_sfn: u16,
    /// Break the broadcast CRC in every frame
    pub corrupt_bch: bool,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            profile: RadioProfile::Lte,
            fft_size: 128,
            pci: 0,
            cp: CyclicPrefix::Normal,
            duplex: DuplexMode::Fdd,
            cfo_hz: 0.0,
            snr_db: None,
            seed: 1,
            sample_offset: 0,
            start_sfn: 0,
            corrupt_bch: false,
        }
    }
}

/// Subcarrier offset of broadcast element `i` (-24..-1, 1..24)
pub fn bch_subcarrier(i: usize) -> i32 {
    if i < BCH_SUBCARRIERS / 2 {
        i as i32 - 24
    } else {
        i as i32 - 23
    }
}

/// Broadcast payload bits: MIB, 2-bit frame offset, CRC-16 over both
pub fn bch_bits(mib: &Mib, sfn_offset: u8) -> Vec<u8> {
    let mut bits = mib.encode_bits();
    push_bits(&mut bits, (sfn_offset & 3) as u32, 2);
    let crc = crc16_bits(&bits);
    push_bits(&mut bits, crc as u32, 16);
    bits
}

/// Differential BPSK: reference +1, each bit flips the sign when set
pub fn bch_symbols(bits: &[u8]) -> Vec<Complex32> {
    let mut symbols = Vec::with_capacity(BCH_SUBCARRIERS);
    let mut current = 1.0f32;
    symbols.push(Complex32::new(current, 0.0));
    for i in 0..BCH_SUBCARRIERS - 1 {
        let bit = bits.get(i).copied().unwrap_or(0);
        current *= 1.0 - 2.0 * bit as f32;
        symbols.push(Complex32::new(current, 0.0));
    }
    symbols
}

/// Frequency-domain content of one subframe, one row per OFDM symbol
struct SubframeGrid {
    grid: Array2<Complex32>,
}

impl SubframeGrid {
    fn new(symbols: usize, fft_size: usize) -> Self {
        Self {
            grid: Array2::zeros((symbols, fft_size)),
        }
    }

    fn clear(&mut self) {
        self.grid.fill(Complex32::new(0.0, 0.0));
    }

    fn set(&mut self, symbol: usize, bin: usize, value: Complex32) {
        self.grid[[symbol, bin]] = value;
    }

    fn symbol(&self, symbol: usize) -> Vec<Complex32> {
        self.grid.row(symbol).to_vec()
    }
}

/// Deterministic downlink sample generator
pub struct DownlinkSynth {
    config: SynthConfig,
    numerology: Numerology,
    bandwidth: DlBandwidth,
    pci: Pci,
    pss: Vec<Complex32>,
    sss: [Vec<f32>; 2],
    npss: Vec<Vec<Complex32>>,
    /// Signal sample index of the next output sample
    position: u64,
    frame: Option<(u64, Vec<Complex32>)>,
    rng: StdRng,
    noise: Option<Normal<f32>>,
}

impl DownlinkSynth {
    pub fn new(config: SynthConfig) -> Result<Self, PhyError> {
        let numerology = Numerology::new(config.fft_size)?;
        let pci = Pci::new(config.pci)
            .ok_or_else(|| PhyError::InvalidConfig(format!("PCI {} out of range (0-503)", config.pci)))?;
        let bandwidth = DlBandwidth::from_fft_size(config.fft_size)
            .ok_or_else(|| PhyError::InvalidConfig(format!("No bandwidth for FFT size {}", config.fft_size)))?;
        if config.profile == RadioProfile::Nbiot && config.cp != CyclicPrefix::Normal {
            return Err(PhyError::InvalidConfig("NB-IoT uses normal CP only".to_string()));
        }

        let mseq = MSequences::new();
        let sss = [
            sss_sequence(&mseq, pci.nid1(), pci.nid2(), false)?,
            sss_sequence(&mseq, pci.nid1(), pci.nid2(), true)?,
        ];

        // Noise is referenced to the per-sample power of the primary sync symbol
        let occupied = match config.profile {
            RadioProfile::Lte => PSS_LENGTH,
            RadioProfile::Nbiot => NPSS_LENGTH,
        };
        let noise = match config.snr_db {
            Some(snr_db) => {
                let signal_power = occupied as f32 / config.fft_size as f32;
                let noise_power = signal_power / 10f32.powf(snr_db / 10.0);
                Some(
                    Normal::new(0.0, (noise_power / 2.0).sqrt())
                        .map_err(|e| PhyError::InvalidConfig(format!("Noise distribution: {}", e)))?,
                )
            }
            None => None,
        };

        info!(
            "Synthetic {:?} downlink: PCI {} {:?}/{:?} FFT {} CFO {} Hz SNR {:?} dB",
            config.profile, pci, config.cp, config.duplex, config.fft_size, config.cfo_hz, config.snr_db
        );

        Ok(Self {
            numerology,
            bandwidth,
            pci,
            pss: pss_sequence(pci.nid2())?,
            sss,
            npss: npss_sequence(),
            position: config.sample_offset as u64,
            frame: None,
            rng: StdRng::seed_from_u64(config.seed),
            noise,
            config,
        })
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    pub fn numerology(&self) -> &Numerology {
        &self.numerology
    }

    /// SFN of the `frame_index`-th signal frame
    fn sfn_at(&self, frame_index: u64) -> u16 {
        ((self.config.start_sfn as u64 + frame_index) % 1024) as u16
    }

    /// Clean time-domain frame for `sfn`
    pub fn generate_frame(&self, sfn: u16) -> Result<Vec<Complex32>, PhyError> {
        let num = &self.numerology;
        let n = num.fft_size();
        let cp = self.config.cp;
        let symbols = num.symbols_per_subframe(cp);

        let mut frame = Vec::new();
        frame
            .try_reserve_exact(num.frame_len())
            .map_err(|e| PhyError::AllocationFailure(format!("synthetic frame: {}", e)))?;

        let mut modulator = OfdmModulator::new(n)?;
        let mut grid = SubframeGrid::new(symbols, n);
        for subframe in 0..SUBFRAMES_PER_FRAME {
            grid.clear();
            match self.config.profile {
                RadioProfile::Lte => self.fill_lte(&mut grid, subframe, sfn)?,
                RadioProfile::Nbiot => self.fill_nbiot(&mut grid, subframe, sfn)?,
            }
            for l in 0..symbols {
                modulator.modulate_into(&grid.symbol(l), num.cp_len(cp, l), &mut frame)?;
            }
        }

        if self.config.profile == RadioProfile::Nbiot {
            apply_frequency_shift(&mut frame, NB_FREQ_SHIFT * 15_000.0, num.sample_rate(), 0);
        }
        trace!("Generated frame SFN {} ({} samples)", sfn, frame.len());
        Ok(frame)
    }

    fn fill_lte(&self, grid: &mut SubframeGrid, subframe: usize, sfn: u16) -> Result<(), PhyError> {
        let num = &self.numerology;
        let n = num.fft_size();
        let cp = self.config.cp;
        let duplex = self.config.duplex;
        let half = subframe % SUBFRAMES_PER_HALF_FRAME;

        let pss = num.pss_position(duplex, cp);
        if half == pss.subframe {
            for (i, &d) in self.pss.iter().enumerate() {
                grid.set(pss.symbol, pss_bin(i, n), d);
            }
        }

        let sss = num.sss_position(duplex, cp);
        if half == sss.subframe {
            let seq = &self.sss[(subframe >= SUBFRAMES_PER_HALF_FRAME) as usize];
            for (i, &d) in seq.iter().enumerate() {
                grid.set(sss.symbol, pss_bin(i, n), Complex32::new(d, 0.0));
            }
        }

        if subframe == 0 {
            let mib = Mib::new(self.bandwidth, sfn);
            let mut bits = bch_bits(&mib, (sfn % 4) as u8);
            if self.config.corrupt_bch {
                bits[3] ^= 1;
            }
            let symbols = bch_symbols(&bits);
            for l in 0..BCH_SYMBOLS {
                let symbol = cp.symbols_per_slot() + l;
                for (i, &d) in symbols.iter().enumerate() {
                    grid.set(symbol, subcarrier_bin(bch_subcarrier(i), n), d);
                }
            }
        }
        Ok(())
    }

    fn fill_nbiot(&self, grid: &mut SubframeGrid, subframe: usize, sfn: u16) -> Result<(), PhyError> {
        let n = self.numerology.fft_size();
        if subframe == 5 {
            for (l, symbol) in self.npss.iter().enumerate() {
                for (k, &d) in symbol.iter().enumerate() {
                    grid.set(NPSS_FIRST_SYMBOL + l, nb_bin(k, n), d);
                }
            }
        }
        if subframe == 9 && sfn % 2 == 0 {
            let nsss = nsss_sequence(self.pci.0, ((sfn / 2) % 4) as u8)?;
            for (l, symbol) in nsss.chunks(NB_SUBCARRIERS).enumerate() {
                for (k, &d) in symbol.iter().enumerate() {
                    grid.set(NPSS_FIRST_SYMBOL + l, nb_bin(k, n), d);
                }
            }
        }
        Ok(())
    }

    /// Next `count` stream samples with CFO and noise applied
    pub fn next_samples(&mut self, count: usize) -> Result<Vec<Complex32>, PhyError> {
        let frame_len = self.numerology.frame_len() as u64;
        let start = self.position;

        let mut out = Vec::new();
        out.try_reserve_exact(count)
            .map_err(|e| PhyError::AllocationFailure(format!("synthetic samples: {}", e)))?;

        while out.len() < count {
            let frame_index = self.position / frame_len;
            let offset = (self.position % frame_len) as usize;
            if self.frame.as_ref().map(|(i, _)| *i) != Some(frame_index) {
                let samples = self.generate_frame(self.sfn_at(frame_index))?;
                self.frame = Some((frame_index, samples));
            }
            if let Some((_, frame)) = &self.frame {
                let take = (count - out.len()).min(frame.len() - offset);
                out.extend_from_slice(&frame[offset..offset + take]);
                self.position += take as u64;
            }
        }

        apply_frequency_shift(&mut out, self.config.cfo_hz, self.numerology.sample_rate(), start);
        if let Some(noise) = &self.noise {
            for s in out.iter_mut() {
                *s += Complex32::new(noise.sample(&mut self.rng), noise.sample(&mut self.rng));
            }
        }
        Ok(out)
    }
}

/// `RfFrontend` backed by [`DownlinkSynth`]
pub struct SyntheticFrontend {
    synth: DownlinkSynth,
    gain: GainHandle,
    streaming: bool,
    timestamp: u64,
    center_freq_hz: f64,
    /// Total samples available, `None` for an endless stream
    limit: Option<u64>,
}

impl SyntheticFrontend {
    pub fn new(config: SynthConfig) -> Result<Self, PhyError> {
        Ok(Self {
            synth: DownlinkSynth::new(config)?,
            gain: GainHandle::default(),
            streaming: false,
            timestamp: 0,
            center_freq_hz: 0.0,
            limit: None,
        })
    }

    /// End the stream after `samples` samples
    pub fn with_limit(mut self, samples: u64) -> Self {
        self.limit = Some(samples);
        self
    }

    pub fn synth(&self) -> &DownlinkSynth {
        &self.synth
    }

    pub fn center_frequency(&self) -> f64 {
        self.center_freq_hz
    }
}

impl RfFrontend for SyntheticFrontend {
    fn receive(&mut self, buffers: &mut [&mut [Complex32]], count: usize) -> Result<u64, RfError> {
        check_buffers(buffers, 1, count)?;
        if !self.streaming {
            return Err(RfError::NotStreaming);
        }
        if let Some(limit) = self.limit {
            if self.timestamp + count as u64 > limit {
                return Err(RfError::EndOfStream);
            }
        }

        let samples = self
            .synth
            .next_samples(count)
            .map_err(|e| RfError::Device(e.to_string()))?;
        let amplitude = db_to_amplitude(self.gain.get());
        for (out, s) in buffers[0].iter_mut().zip(samples.iter()) {
            *out = s * amplitude;
        }

        let timestamp = self.timestamp;
        self.timestamp += count as u64;
        Ok(timestamp)
    }

    fn set_center_frequency(&mut self, freq_hz: f64) -> Result<(), RfError> {
        self.center_freq_hz = freq_hz;
        Ok(())
    }

    fn set_sample_rate(&mut self, rate_hz: f64) -> Result<(), RfError> {
        let native = self.synth.numerology().sample_rate();
        if (rate_hz - native).abs() > 1.0 {
            return Err(RfError::Unsupported(format!(
                "synthetic source runs at {} Hz, requested {} Hz",
                native, rate_hz
            )));
        }
        Ok(())
    }

    fn set_rx_gain(&mut self, gain_db: f32) -> Result<(), RfError> {
        self.gain.set(gain_db);
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), RfError> {
        debug!("Synthetic source streaming");
        self.streaming = true;
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), RfError> {
        self.streaming = false;
        Ok(())
    }

    fn gain_handle(&self) -> GainHandle {
        self.gain.clone()
    }
}

/// Decoder for the loopback broadcast block
#[derive(Default)]
pub struct LoopbackBchDecoder {
    demod: Option<OfdmDemodulator>,
}

impl LoopbackBchDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BroadcastDecoder for LoopbackBchDecoder {
    fn decode(&mut self, subframe: &[Complex32], params: &CellParams) -> BchOutcome {
        let Ok(num) = Numerology::new(params.fft_size) else {
            return BchOutcome::NotFound;
        };
        if subframe.len() < num.subframe_len() {
            return BchOutcome::NotFound;
        }
        let n = num.fft_size();
        if self.demod.as_ref().map(|d| d.fft_size()) != Some(n) {
            self.demod = Some(OfdmDemodulator::new(n));
        }
        let Some(demod) = &self.demod else {
            return BchOutcome::NotFound;
        };

        // Differential products summed over the repeated symbols
        let mut products = vec![Complex32::new(0.0, 0.0); BCH_SUBCARRIERS - 1];
        for l in 0..BCH_SYMBOLS {
            let u = num.useful_start(params.cp, params.cp.symbols_per_slot() + l);
            let Ok(bins) = demod.demodulate(&subframe[u..u + n]) else {
                return BchOutcome::NotFound;
            };
            let y: Vec<Complex32> = (0..BCH_SUBCARRIERS)
                .map(|i| bins[subcarrier_bin(bch_subcarrier(i), n)])
                .collect();
            for (i, p) in products.iter_mut().enumerate() {
                *p += y[i + 1] * y[i].conj();
            }
        }
        if products.iter().all(|p| p.norm_sqr() == 0.0) {
            return BchOutcome::NotFound;
        }

        let bits: Vec<u8> = products.iter().map(|p| (p.re < 0.0) as u8).collect();
        let crc = crc16_bits(&bits[..MIB_BITS + 2]);
        if crc as u32 != read_bits(&bits, MIB_BITS + 2, 16) {
            trace!("Loopback BCH CRC mismatch");
            return BchOutcome::NotFound;
        }

        let values: Vec<f32> = products.iter().map(|p| p.re.abs()).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / values.len() as f32;
        let snr_db = if var > 0.0 {
            (10.0 * (mean * mean / var).log10()).min(BCH_MAX_SNR_DB)
        } else {
            BCH_MAX_SNR_DB
        };

        BchOutcome::Decoded {
            payload: pack_bits(&bits[..MIB_BITS]),
            sfn_offset: read_bits(&bits, MIB_BITS, 2) as u8,
            snr_db,
        }
    }
}
