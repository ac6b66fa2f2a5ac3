//! LTE Downlink Numerology
//!
//! Frame structure for 15 kHz subcarrier spacing according to 3GPP TS 36.211:
//! cyclic prefix lengths, symbol positions and the location of the
//! synchronization signals for each duplex mode.

use crate::PhyError;
use common::types::{CyclicPrefix, DuplexMode};

/// Supported FFT sizes (6/15/25/50/75/100 PRB)
pub const SUPPORTED_FFT_SIZES: [usize; 6] = [128, 256, 512, 1024, 1536, 2048];

/// Subcarrier spacing in Hz
pub const SUBCARRIER_SPACING_HZ: f64 = 15_000.0;

/// Subframes per radio frame
pub const SUBFRAMES_PER_FRAME: usize = 10;

/// Subframes per half frame
pub const SUBFRAMES_PER_HALF_FRAME: usize = 5;

/// Position of a synchronization symbol in the first half frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPosition {
    /// Subframe index (the second half frame adds 5)
    pub subframe: usize,
    /// Symbol index within the subframe
    pub symbol: usize,
}

/// Time-domain layout for one FFT size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Numerology {
    fft_size: usize,
}

impl Numerology {
    pub fn new(fft_size: usize) -> Result<Self, PhyError> {
        if !SUPPORTED_FFT_SIZES.contains(&fft_size) {
            return Err(PhyError::InvalidConfig(format!(
                "Unsupported FFT size {} (expected one of {:?})",
                fft_size, SUPPORTED_FFT_SIZES
            )));
        }
        Ok(Self { fft_size })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Sample rate in Hz
    pub fn sample_rate(&self) -> f64 {
        self.fft_size as f64 * SUBCARRIER_SPACING_HZ
    }

    /// CP length of `symbol` (index within the subframe)
    pub fn cp_len(&self, cp: CyclicPrefix, symbol: usize) -> usize {
        let n = self.fft_size;
        match cp {
            CyclicPrefix::Normal => {
                if symbol % cp.symbols_per_slot() == 0 {
                    160 * n / 2048
                } else {
                    144 * n / 2048
                }
            }
            CyclicPrefix::Extended => 512 * n / 2048,
        }
    }

    /// CP lengths for every symbol of a subframe
    pub fn cp_table(&self, cp: CyclicPrefix) -> Vec<usize> {
        (0..self.symbols_per_subframe(cp))
            .map(|l| self.cp_len(cp, l))
            .collect()
    }

    pub fn symbols_per_subframe(&self, cp: CyclicPrefix) -> usize {
        2 * cp.symbols_per_slot()
    }

    /// Start of `symbol` (first CP sample) relative to the subframe start
    pub fn symbol_start(&self, cp: CyclicPrefix, symbol: usize) -> usize {
        (0..symbol)
            .map(|l| self.fft_size + self.cp_len(cp, l))
            .sum()
    }

    /// Start of the useful part of `symbol` relative to the subframe start
    pub fn useful_start(&self, cp: CyclicPrefix, symbol: usize) -> usize {
        self.symbol_start(cp, symbol) + self.cp_len(cp, symbol)
    }

    pub fn slot_len(&self) -> usize {
        self.subframe_len() / 2
    }

    pub fn subframe_len(&self) -> usize {
        15 * self.fft_size
    }

    pub fn half_frame_len(&self) -> usize {
        SUBFRAMES_PER_HALF_FRAME * self.subframe_len()
    }

    pub fn frame_len(&self) -> usize {
        SUBFRAMES_PER_FRAME * self.subframe_len()
    }

    /// PSS location in the first half frame
    pub fn pss_position(&self, duplex: DuplexMode, cp: CyclicPrefix) -> SyncPosition {
        match duplex {
            DuplexMode::Fdd => SyncPosition {
                subframe: 0,
                symbol: cp.symbols_per_slot() - 1,
            },
            DuplexMode::Tdd => SyncPosition {
                subframe: 1,
                symbol: 2,
            },
        }
    }

    /// SSS location in the first half frame
    pub fn sss_position(&self, duplex: DuplexMode, cp: CyclicPrefix) -> SyncPosition {
        match duplex {
            DuplexMode::Fdd => SyncPosition {
                subframe: 0,
                symbol: cp.symbols_per_slot() - 2,
            },
            DuplexMode::Tdd => SyncPosition {
                subframe: 0,
                symbol: self.symbols_per_subframe(cp) - 1,
            },
        }
    }

    /// Offset of the useful part of a sync symbol from the half-frame start
    pub fn useful_offset(&self, position: SyncPosition, cp: CyclicPrefix) -> usize {
        position.subframe * self.subframe_len() + self.useful_start(cp, position.symbol)
    }

    /// PSS useful-part offset from the half-frame start
    pub fn pss_useful_offset(&self, duplex: DuplexMode, cp: CyclicPrefix) -> usize {
        self.useful_offset(self.pss_position(duplex, cp), cp)
    }

    /// CP lengths walking back from the PSS: the PSS symbol first, then
    /// the `count` symbols before it, nearest first
    pub fn pss_lookback_cp(&self, duplex: DuplexMode, cp: CyclicPrefix, count: usize) -> Vec<usize> {
        let symbols = self.symbols_per_subframe(cp) as isize;
        let pss = self.pss_position(duplex, cp);
        let first = (pss.subframe * self.symbols_per_subframe(cp) + pss.symbol) as isize;
        (0..=count as isize)
            .map(|k| self.cp_len(cp, (first - k).rem_euclid(symbols) as usize))
            .collect()
    }

    /// Distance from the SSS useful part to the PSS useful part
    pub fn pss_sss_distance(&self, duplex: DuplexMode, cp: CyclicPrefix) -> usize {
        self.pss_useful_offset(duplex, cp) - self.useful_offset(self.sss_position(duplex, cp), cp)
    }
}
