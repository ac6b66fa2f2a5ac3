//! Subframe Tracker
//!
//! Cuts the frequency-corrected stream into 1 ms subframes once the frame
//! timing is known. Subframes carrying the PSS are re-correlated within a
//! CP-sized search range to follow timing drift; too many consecutive
//! misses report loss of synchronization.

use crate::cell_search::FrameTiming;
use crate::numerology::{Numerology, SUBFRAMES_PER_FRAME, SUBFRAMES_PER_HALF_FRAME};
use crate::sequence::ReferenceKernel;
use crate::PhyError;
use common::types::{CyclicPrefix, DuplexMode, Pci};
use num_complex::Complex32;
use tracing::{debug, trace, warn};

/// Normalized PSS correlation needed to count as a hit
pub const TRACK_MIN_CORRELATION: f32 = 0.2;

/// One received subframe
#[derive(Debug, Clone, PartialEq)]
pub struct Subframe {
    /// Subframe index within the radio frame (0..9)
    pub index: u8,
    /// Absolute stream position of the first sample
    pub start: u64,
    pub samples: Vec<Complex32>,
}

/// Tracker output
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEvent {
    Subframe(Subframe),
    SyncLost { misses: usize },
}

/// Subframe tracker for one cell
pub struct SubframeTracker {
    numerology: Numerology,
    duplex: DuplexMode,
    kernel: ReferenceKernel,
    /// PSS kernel start relative to the start of its subframe
    pss_offset: usize,
    search_range: usize,
    max_misses: usize,
    buffer: Vec<Complex32>,
    buffer_start: u64,
    next_boundary: u64,
    next_index: u8,
    misses: usize,
    lost: bool,
}

impl SubframeTracker {
    /// Track `pci` from `timing`; `position` is the stream position of the
    /// next sample passed to [`SubframeTracker::push`]
    pub fn new(
        numerology: Numerology,
        pci: Pci,
        cp: CyclicPrefix,
        duplex: DuplexMode,
        timing: FrameTiming,
        position: u64,
        max_misses: usize,
    ) -> Result<Self, PhyError> {
        let kernel = ReferenceKernel::pss(pci.nid2(), &numerology)?;
        let pss = numerology.pss_position(duplex, cp);
        let pss_offset = numerology.useful_start(cp, pss.symbol) - kernel.anchor();
        let (next_boundary, next_index) = timing.next_subframe(position);

        debug!(
            "Tracking PCI {} from sample {} (subframe {})",
            pci, next_boundary, next_index
        );

        Ok(Self {
            numerology,
            duplex,
            kernel,
            pss_offset,
            search_range: numerology.cp_len(cp, 1),
            max_misses,
            buffer: Vec::new(),
            buffer_start: position,
            next_boundary,
            next_index,
            misses: 0,
            lost: false,
        })
    }

    /// Stream position of the next subframe boundary
    pub fn next_boundary(&self) -> u64 {
        self.next_boundary
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    fn is_pss_subframe(&self, index: u8) -> bool {
        let first = match self.duplex {
            DuplexMode::Fdd => 0,
            DuplexMode::Tdd => 1,
        };
        index as usize % SUBFRAMES_PER_HALF_FRAME == first
    }

    /// Append samples and emit every subframe they complete
    pub fn push(&mut self, samples: &[Complex32], events: &mut Vec<TrackEvent>) -> Result<(), PhyError> {
        if self.lost {
            return Ok(());
        }
        self.buffer
            .try_reserve(samples.len())
            .map_err(|e| PhyError::AllocationFailure(format!("tracker buffer: {}", e)))?;
        self.buffer.extend_from_slice(samples);

        let sf_len = self.numerology.subframe_len();
        loop {
            let end = self.buffer_start + self.buffer.len() as u64;
            if end < self.next_boundary + (sf_len + self.search_range) as u64 {
                break;
            }

            let index = self.next_index;
            let mut boundary = self.next_boundary;
            if self.is_pss_subframe(index) {
                match self.measure_drift(boundary) {
                    Some(drift) => {
                        self.misses = 0;
                        if drift != 0 && boundary as i64 + drift >= self.buffer_start as i64 {
                            debug!("Subframe {}: timing drift {} samples", index, drift);
                            boundary = (boundary as i64 + drift) as u64;
                        }
                    }
                    None => {
                        self.misses += 1;
                        trace!("Subframe {}: PSS missed ({} in a row)", index, self.misses);
                        if self.misses > self.max_misses {
                            warn!("Sync lost after {} missed PSS", self.misses);
                            self.lost = true;
                            events.push(TrackEvent::SyncLost { misses: self.misses });
                            return Ok(());
                        }
                    }
                }
            }

            let from = (boundary - self.buffer_start) as usize;
            events.push(TrackEvent::Subframe(Subframe {
                index,
                start: boundary,
                samples: self.buffer[from..from + sf_len].to_vec(),
            }));

            self.next_boundary = boundary + sf_len as u64;
            self.next_index = (index + 1) % SUBFRAMES_PER_FRAME as u8;
            self.discard_before(self.next_boundary.saturating_sub(self.search_range as u64));
        }
        Ok(())
    }

    /// Best PSS lag around the expected position, `None` on a miss
    fn measure_drift(&self, boundary: u64) -> Option<i64> {
        let k = self.kernel.samples();
        let k_energy = self.kernel.energy();
        let expected = (boundary + self.pss_offset as u64) as i64;
        let range = self.search_range as i64;

        let mut best: Option<(f32, i64)> = None;
        for lag in -range..=range {
            let start = expected + lag - self.buffer_start as i64;
            if start < 0 || start as usize + k.len() > self.buffer.len() {
                continue;
            }
            let r = &self.buffer[start as usize..start as usize + k.len()];
            let acc: Complex32 = r.iter().zip(k.iter()).map(|(x, y)| x * y.conj()).sum();
            let r_energy: f32 = r.iter().map(|s| s.norm_sqr()).sum();
            if r_energy <= 0.0 {
                continue;
            }
            let metric = acc.norm_sqr() / (k_energy * r_energy);
            if best.map_or(true, |(m, _)| metric > m) {
                best = Some((metric, lag));
            }
        }

        match best {
            Some((metric, lag)) if metric >= TRACK_MIN_CORRELATION => {
                trace!("PSS tracked at lag {} metric {:.3}", lag, metric);
                Some(lag)
            }
            _ => None,
        }
    }

    fn discard_before(&mut self, position: u64) {
        if position <= self.buffer_start {
            return;
        }
        let count = ((position - self.buffer_start) as usize).min(self.buffer.len());
        self.buffer.drain(..count);
        self.buffer_start += count as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{DownlinkSynth, SynthConfig};

    fn tracker_for(config: &SynthConfig, offset: u64, position: u64) -> SubframeTracker {
        let num = Numerology::new(config.fft_size).unwrap();
        // Signal frame starts sit at -offset modulo the frame length
        let timing = FrameTiming::new(-(offset as i64), &num);
        SubframeTracker::new(
            num,
            Pci(config.pci),
            config.cp,
            config.duplex,
            timing,
            position,
            2,
        )
        .unwrap()
    }

    fn subframes(events: &[TrackEvent]) -> Vec<&Subframe> {
        events
            .iter()
            .filter_map(|e| match e {
                TrackEvent::Subframe(sf) => Some(sf),
                TrackEvent::SyncLost { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_delivers_aligned_subframes() {
        let config = SynthConfig {
            pci: 17,
            sample_offset: 700,
            ..SynthConfig::default()
        };
        let mut synth = DownlinkSynth::new(config.clone()).unwrap();
        let stream = synth.next_samples(3 * 19200).unwrap();

        let mut tracker = tracker_for(&config, 700, 0);
        let mut events = Vec::new();
        for chunk in stream.chunks(1000) {
            tracker.push(chunk, &mut events).unwrap();
        }

        let sfs = subframes(&events);
        assert!(sfs.len() >= 25);
        // Stream sample 0 lies 700 samples into subframe 0
        assert_eq!(sfs[0].index, 1);
        assert_eq!(sfs[0].start, 1920 - 700);
        assert!(sfs.iter().any(|sf| sf.index == 0 && sf.start == 19200 - 700));
        for pair in sfs.windows(2) {
            assert_eq!(pair[1].start - pair[0].start, 1920);
            assert_eq!(pair[1].index, (pair[0].index + 1) % 10);
        }
        assert_eq!(tracker.misses(), 0);
        assert!(!tracker.is_lost());
    }

    #[test]
    fn test_follows_timing_drift() {
        let config = SynthConfig {
            pci: 5,
            duplex: DuplexMode::Tdd,
            ..SynthConfig::default()
        };
        let mut synth = DownlinkSynth::new(config.clone()).unwrap();
        let stream = synth.next_samples(2 * 19200).unwrap();

        // Timing estimate three samples early
        let mut tracker = tracker_for(&config, 3, 0);
        let mut events = Vec::new();
        tracker.push(&stream, &mut events).unwrap();

        let sfs = subframes(&events);
        // The PSS in subframe 1 moves the boundary from 1917 to 1920
        assert_eq!(sfs[0].index, 1);
        assert_eq!(sfs[0].start, 1920);
        assert_eq!(sfs[1].start, 2 * 1920);
        let next_frame = sfs.iter().find(|sf| sf.index == 0).unwrap();
        assert_eq!(next_frame.start, 19200);
    }

    #[test]
    fn test_sync_lost_on_silence() {
        let config = SynthConfig::default();
        let mut tracker = tracker_for(&config, 0, 0);
        let mut events = Vec::new();
        let silence = vec![Complex32::new(0.0, 0.0); 3 * 19200];
        tracker.push(&silence, &mut events).unwrap();

        assert!(tracker.is_lost());
        assert_eq!(events.last(), Some(&TrackEvent::SyncLost { misses: 3 }));
        // Nothing more once lost
        let before = events.len();
        tracker.push(&silence, &mut events).unwrap();
        assert_eq!(events.len(), before);
    }
}
