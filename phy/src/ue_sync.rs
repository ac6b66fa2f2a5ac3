//! UE Synchronization Engine
//!
//! Pulls samples from an RF front-end window by window, runs the cell
//! search and, for LTE, tracks subframes until the frame number is known.

use crate::agc::{mean_power_db, PowerMeter};
use crate::cell_search::{CellSearch, CellSearchResult, ScanOutcome};
use crate::config::{RadioProfile, SyncConfig};
use crate::numerology::Numerology;
use crate::ofdm::apply_cfo_correction;
use crate::sfn::{SfnSynchronizer, SyncOutcome};
use crate::tracker::{SubframeTracker, TrackEvent};
use crate::{BroadcastDecoder, CellParams, PhyError};
use interfaces::rf::{GainHandle, RfError, RfFrontend};
use num_complex::Complex32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cell search and synchronization over one RF front-end
pub struct UeSync<R: RfFrontend, D: BroadcastDecoder> {
    config: SyncConfig,
    numerology: Numerology,
    rf: R,
    decoder: D,
    search: CellSearch,
    /// History followed by the newest window
    analysis: Vec<Complex32>,
    block: Vec<Complex32>,
    /// Stream position of the next sample from the front-end
    position: u64,
    streaming: bool,
    cancel: Arc<AtomicBool>,
    power: PowerMeter,
    tracker: Option<SubframeTracker>,
    sfn: Option<SfnSynchronizer>,
}

impl<R: RfFrontend, D: BroadcastDecoder> UeSync<R, D> {
    pub fn new(config: SyncConfig, rf: R, decoder: D) -> Result<Self, PhyError> {
        let search = CellSearch::new(&config)?;
        let numerology = *search.numerology();
        let window_len = search.window_len();
        let history_len = search.history_len();

        let mut analysis = Vec::new();
        analysis
            .try_reserve_exact(history_len + window_len)
            .map_err(|e| PhyError::AllocationFailure(format!("analysis buffer: {}", e)))?;
        let block = crate::try_alloc(window_len, Complex32::new(0.0, 0.0), "receive buffer")?;

        Ok(Self {
            config,
            numerology,
            rf,
            decoder,
            search,
            analysis,
            block,
            position: 0,
            streaming: false,
            cancel: Arc::new(AtomicBool::new(false)),
            power: PowerMeter::new(),
            tracker: None,
            sfn: None,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Flag checked at every window boundary; setting it aborts with `Cancelled`
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Window power published for the AGC task
    pub fn power_meter(&self) -> PowerMeter {
        self.power.clone()
    }

    pub fn gain_handle(&self) -> GainHandle {
        self.rf.gain_handle()
    }

    pub fn rf(&self) -> &R {
        &self.rf
    }

    pub fn rf_mut(&mut self) -> &mut R {
        &mut self.rf
    }

    /// Stream position of the next sample to be received
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Drop all search and synchronization state
    pub fn reset(&mut self) {
        self.search.reset();
        self.analysis.clear();
        self.tracker = None;
        self.sfn = None;
        debug!("Synchronization state reset");
    }

    fn ensure_streaming(&mut self) -> Result<(), PhyError> {
        if !self.streaming {
            self.rf.start_streaming()?;
            self.streaming = true;
        }
        Ok(())
    }

    fn check_cancel(&self) -> Result<(), PhyError> {
        if self.cancel.load(Ordering::Relaxed) {
            info!("Synchronization cancelled");
            return Err(PhyError::Cancelled);
        }
        Ok(())
    }

    /// Receive `count` samples into the block buffer
    ///
    /// Returns false when a gap in the front-end timestamps was detected.
    fn receive_block(&mut self, count: usize) -> Result<bool, PhyError> {
        let timestamp = self.rf.receive(&mut [&mut self.block[..count]], count)?;
        let contiguous = timestamp == self.position;
        if !contiguous {
            warn!("Stream discontinuity: expected sample {}, got {}", self.position, timestamp);
        }
        self.position = timestamp + count as u64;
        self.power.publish(mean_power_db(&self.block[..count]));
        Ok(contiguous)
    }

    /// Search for a cell until every variant finished or the budget ran out
    pub fn scan_for_cell(&mut self) -> Result<ScanOutcome, PhyError> {
        self.ensure_streaming()?;
        self.reset();

        let window_len = self.search.window_len();
        let history_len = self.search.history_len();
        self.analysis.resize(history_len, Complex32::new(0.0, 0.0));
        info!(
            "Scanning for {:?} cells: {} sample windows, up to {} windows",
            self.config.profile, window_len, self.config.max_frames
        );

        while !self.search.is_finished() {
            self.check_cancel()?;
            match self.receive_block(window_len) {
                Ok(true) => {}
                Ok(false) => {
                    // Old samples no longer precede the window
                    self.analysis.clear();
                    self.analysis.resize(history_len, Complex32::new(0.0, 0.0));
                }
                Err(PhyError::Rf(RfError::EndOfStream)) => {
                    info!("Sample stream ended after {} windows", self.search.windows());
                    break;
                }
                Err(e) => return Err(e),
            }

            self.analysis.extend_from_slice(&self.block[..window_len]);
            let origin = self.position as i64 - self.analysis.len() as i64;
            self.search.process_window(&self.analysis, origin)?;
            self.analysis.drain(..window_len);
        }

        Ok(self.search.outcome())
    }

    /// Track the cell found by `scan_for_cell` until its SFN is decoded
    pub fn synchronize(&mut self, cell: &CellSearchResult) -> Result<SyncOutcome, PhyError> {
        if cell.profile != RadioProfile::Lte || self.config.profile != RadioProfile::Lte {
            return Err(PhyError::InvalidConfig(
                "frame number synchronization is only available for LTE".to_string(),
            ));
        }
        self.ensure_streaming()?;

        let params = CellParams {
            pci: cell.pci,
            cp: cell.cp,
            duplex: cell.duplex,
            fft_size: self.numerology.fft_size(),
            cfo_hz: cell.cfo_hz,
        };
        self.tracker = Some(SubframeTracker::new(
            self.numerology,
            cell.pci,
            cell.cp,
            cell.duplex,
            cell.timing,
            self.position,
            self.config.max_track_misses,
        )?);
        self.sfn = Some(SfnSynchronizer::new(
            params,
            self.config.min_snr_db,
            self.config.sfn_timeout_subframes,
        ));
        info!(
            "Synchronizing to PCI {} ({:?}/{:?}, CFO {:.1} Hz)",
            cell.pci, cell.cp, cell.duplex, cell.cfo_hz
        );

        let block_len = self.search.window_len();
        let sample_rate = self.numerology.sample_rate();
        let mut events = Vec::new();
        loop {
            self.check_cancel()?;
            if !self.receive_block(block_len)? {
                warn!("Timing lost with the stream discontinuity");
                return Ok(self.sfn_session()?.on_sync_lost());
            }
            let start = self.position - block_len as u64;
            apply_cfo_correction(&mut self.block[..block_len], cell.cfo_hz, sample_rate, start);

            events.clear();
            let (Some(tracker), Some(sfn)) = (self.tracker.as_mut(), self.sfn.as_mut()) else {
                return Err(PhyError::ProcessingError("synchronization session missing".to_string()));
            };
            tracker.push(&self.block[..block_len], &mut events)?;
            for event in events.iter() {
                match event {
                    TrackEvent::Subframe(subframe) => {
                        if let Some(outcome) = sfn.on_subframe(subframe, &mut self.decoder) {
                            return Ok(outcome);
                        }
                    }
                    TrackEvent::SyncLost { misses } => {
                        warn!("Lost PCI {} after {} missed PSS", cell.pci, misses);
                        return Ok(sfn.on_sync_lost());
                    }
                }
            }
        }
    }

    fn sfn_session(&mut self) -> Result<&mut SfnSynchronizer, PhyError> {
        self.sfn
            .as_mut()
            .ok_or_else(|| PhyError::ProcessingError("synchronization session missing".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{LoopbackBchDecoder, SynthConfig, SyntheticFrontend};
    use common::types::Pci;

    fn engine(synth: SynthConfig, config: SyncConfig) -> UeSync<SyntheticFrontend, LoopbackBchDecoder> {
        let rf = SyntheticFrontend::new(synth).unwrap();
        UeSync::new(config, rf, LoopbackBchDecoder::new()).unwrap()
    }

    #[test]
    fn test_cancel_before_first_window() {
        let mut sync = engine(SynthConfig::default(), SyncConfig::default());
        sync.cancel_token().store(true, Ordering::Relaxed);
        assert!(matches!(sync.scan_for_cell(), Err(PhyError::Cancelled)));
    }

    #[test]
    fn test_scan_publishes_power_and_positions() {
        let config = SyncConfig {
            max_frames: 4,
            min_valid_frames: 2,
            ..SyncConfig::default()
        };
        let mut sync = engine(
            SynthConfig {
                pci: 3,
                ..SynthConfig::default()
            },
            config,
        );
        let meter = sync.power_meter();
        assert_eq!(meter.latest(), None);

        let ScanOutcome::Found(cell) = sync.scan_for_cell().unwrap() else {
            panic!("cell not found");
        };
        assert_eq!(cell.pci, Pci(3));
        assert!(meter.latest().is_some());
        assert_eq!(sync.position() % 9600, 0);
    }

    #[test]
    fn test_end_of_stream_stops_scan() {
        let rf = SyntheticFrontend::new(SynthConfig::default()).unwrap().with_limit(2 * 9600);
        let mut sync = UeSync::new(SyncConfig::default(), rf, LoopbackBchDecoder::new()).unwrap();
        let outcome = sync.scan_for_cell().unwrap();
        // Votes whatever the two windows produced
        let records = outcome.cell().map_or(0, |cell| cell.num_records);
        assert!(records <= 2);
        assert_eq!(sync.position(), 2 * 9600);
    }

    #[test]
    fn test_nbiot_synchronize_rejected() {
        let config = SyncConfig {
            profile: RadioProfile::Nbiot,
            max_frames: 6,
            min_valid_frames: 2,
            ..SyncConfig::default()
        };
        let mut sync = engine(
            SynthConfig {
                profile: RadioProfile::Nbiot,
                pci: 250,
                ..SynthConfig::default()
            },
            config,
        );
        let ScanOutcome::Found(cell) = sync.scan_for_cell().unwrap() else {
            panic!("NB cell not found");
        };
        assert!(matches!(sync.synchronize(&cell), Err(PhyError::InvalidConfig(_))));
    }
}
