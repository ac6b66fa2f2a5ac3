//! System Frame Number Synchronization
//!
//! Drives the broadcast channel decoder over tracked subframes until a MIB
//! is decoded with sufficient quality, then reports the locked reference.

use crate::mib::Mib;
use crate::tracker::Subframe;
use crate::{BchOutcome, BroadcastDecoder, CellParams};
use common::types::{CyclicPrefix, DuplexMode, Pci};
use common::utils::bytes_to_hex;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, trace, warn};

/// Frame-number acquisition phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    Idle,
    AwaitingSubframeZero,
    DecodingBroadcast,
    Locked,
    /// Last attempt failed, waiting for the next subframe 0
    Retry,
    Failed,
}

/// Why synchronization did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    NoCellFound,
    LowSnr,
    BroadcastNotFound,
    SyncLost,
}

impl FailureReason {
    pub fn reason(&self) -> &'static str {
        match self {
            FailureReason::NoCellFound => "no cell found in scan window",
            FailureReason::LowSnr => "broadcast decode SNR too low",
            FailureReason::BroadcastNotFound => "broadcast channel not decoded within timeout",
            FailureReason::SyncLost => "synchronization lost while tracking",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Timing- and frequency-locked cell reference
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LockedReference {
    pub pci: Pci,
    pub cp: CyclicPrefix,
    pub duplex: DuplexMode,
    pub cfo_hz: f32,
    /// SFN of the frame whose subframe 0 was decoded
    pub sfn: u16,
    pub mib: Mib,
    /// Stream position of that subframe 0
    pub frame_start: u64,
    pub snr_db: f32,
    /// Decode attempts including the successful one
    pub attempts: usize,
}

/// Outcome of `synchronize`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SyncOutcome {
    Locked(LockedReference),
    Failed(FailureReason),
}

impl SyncOutcome {
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            SyncOutcome::Locked(_) => None,
            SyncOutcome::Failed(reason) => Some(reason.reason()),
        }
    }
}

/// Frame-number synchronizer session
pub struct SfnSynchronizer {
    params: CellParams,
    min_snr_db: f32,
    timeout_subframes: usize,
    phase: SyncPhase,
    attempts: usize,
    scanned: usize,
    last_failure: Option<FailureReason>,
    last_sfn: Option<u16>,
}

impl SfnSynchronizer {
    pub fn new(params: CellParams, min_snr_db: f32, timeout_subframes: usize) -> Self {
        Self {
            params,
            min_snr_db,
            timeout_subframes,
            phase: SyncPhase::Idle,
            attempts: 0,
            scanned: 0,
            last_failure: None,
            last_sfn: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn scanned_subframes(&self) -> usize {
        self.scanned
    }

    pub fn last_sfn(&self) -> Option<u16> {
        self.last_sfn
    }

    pub fn reset(&mut self) {
        self.phase = SyncPhase::Idle;
        self.attempts = 0;
        self.scanned = 0;
        self.last_failure = None;
        self.last_sfn = None;
    }

    /// Consume one tracked subframe; returns the outcome once terminal
    pub fn on_subframe<D: BroadcastDecoder + ?Sized>(
        &mut self,
        subframe: &Subframe,
        decoder: &mut D,
    ) -> Option<SyncOutcome> {
        match self.phase {
            SyncPhase::Locked | SyncPhase::Failed => return None,
            SyncPhase::Idle | SyncPhase::Retry => self.phase = SyncPhase::AwaitingSubframeZero,
            SyncPhase::AwaitingSubframeZero | SyncPhase::DecodingBroadcast => {}
        }
        self.scanned += 1;

        if subframe.index == 0 {
            self.phase = SyncPhase::DecodingBroadcast;
            self.attempts += 1;
            if let Some(locked) = self.decode(subframe, decoder) {
                self.phase = SyncPhase::Locked;
                return Some(SyncOutcome::Locked(locked));
            }
            self.phase = SyncPhase::Retry;
        }

        if self.scanned >= self.timeout_subframes {
            let reason = match self.last_failure {
                Some(FailureReason::LowSnr) => FailureReason::LowSnr,
                _ => FailureReason::BroadcastNotFound,
            };
            warn!(
                "Frame number acquisition failed after {} subframes, {} attempts: {}",
                self.scanned, self.attempts, reason
            );
            self.phase = SyncPhase::Failed;
            return Some(SyncOutcome::Failed(reason));
        }
        None
    }

    /// Tracker lost the cell
    pub fn on_sync_lost(&mut self) -> SyncOutcome {
        self.phase = SyncPhase::Failed;
        SyncOutcome::Failed(FailureReason::SyncLost)
    }

    fn decode<D: BroadcastDecoder + ?Sized>(&mut self, subframe: &Subframe, decoder: &mut D) -> Option<LockedReference> {
        match decoder.decode(&subframe.samples, &self.params) {
            BchOutcome::Decoded {
                payload,
                sfn_offset,
                snr_db,
            } => {
                if snr_db < self.min_snr_db {
                    warn!(
                        "Attempt {}: broadcast SNR {:.1} dB below {:.1} dB, retrying",
                        self.attempts, snr_db, self.min_snr_db
                    );
                    self.last_failure = Some(FailureReason::LowSnr);
                    return None;
                }
                trace!(
                    "Attempt {}: BCH payload [{}] offset {} SNR {:.1} dB",
                    self.attempts,
                    bytes_to_hex(&payload),
                    sfn_offset,
                    snr_db
                );
                match Mib::decode(&payload) {
                    Ok(mib) => {
                        let sfn = mib.sfn(sfn_offset);
                        self.last_sfn = Some(sfn);
                        info!(
                            "MIB decoded: SFN {} bandwidth {:?} SNR {:.1} dB (attempt {})",
                            sfn, mib.dl_bandwidth, snr_db, self.attempts
                        );
                        Some(LockedReference {
                            pci: self.params.pci,
                            cp: self.params.cp,
                            duplex: self.params.duplex,
                            cfo_hz: self.params.cfo_hz,
                            sfn,
                            mib,
                            frame_start: subframe.start,
                            snr_db,
                            attempts: self.attempts,
                        })
                    }
                    Err(e) => {
                        warn!("Attempt {}: invalid MIB: {}", self.attempts, e);
                        self.last_failure = Some(FailureReason::BroadcastNotFound);
                        None
                    }
                }
            }
            BchOutcome::NotFound => {
                debug!("Attempt {}: broadcast channel not found", self.attempts);
                self.last_failure = Some(FailureReason::BroadcastNotFound);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use common::types::DlBandwidth;
    use num_complex::Complex32;

    /// Replays a fixed list of outcomes, then reports not found
    struct ScriptedDecoder {
        script: Vec<BchOutcome>,
        calls: usize,
    }

    impl ScriptedDecoder {
        fn new(script: Vec<BchOutcome>) -> Self {
            Self { script, calls: 0 }
        }
    }

    impl BroadcastDecoder for ScriptedDecoder {
        fn decode(&mut self, subframe: &[Complex32], _params: &CellParams) -> BchOutcome {
            assert_eq!(subframe.len(), 1920);
            let outcome = self.script.get(self.calls).cloned().unwrap_or(BchOutcome::NotFound);
            self.calls += 1;
            outcome
        }
    }

    fn params() -> CellParams {
        CellParams {
            pci: Pci(42),
            cp: CyclicPrefix::Normal,
            duplex: DuplexMode::Fdd,
            fft_size: 128,
            cfo_hz: 120.0,
        }
    }

    fn decoded(sfn: u16, offset: u8, snr_db: f32) -> BchOutcome {
        BchOutcome::Decoded {
            payload: Mib::new(DlBandwidth::N6, sfn).encode(),
            sfn_offset: offset,
            snr_db,
        }
    }

    /// Feed subframes 0..9 repeatedly until an outcome or `limit`
    fn run(sync: &mut SfnSynchronizer, decoder: &mut ScriptedDecoder, limit: usize) -> Option<SyncOutcome> {
        for n in 0..limit {
            let subframe = Subframe {
                index: (n % 10) as u8,
                start: (n * 1920) as u64,
                samples: vec![Complex32::new(0.0, 0.0); 1920],
            };
            if let Some(outcome) = sync.on_subframe(&subframe, decoder) {
                return Some(outcome);
            }
        }
        None
    }

    #[test]
    fn test_lock_after_retry() {
        let mut sync = SfnSynchronizer::new(params(), 3.0, 1000);
        let mut decoder = ScriptedDecoder::new(vec![BchOutcome::NotFound, decoded(517, 1, 20.0)]);
        assert_eq!(sync.phase(), SyncPhase::Idle);

        let Some(SyncOutcome::Locked(locked)) = run(&mut sync, &mut decoder, 100) else {
            panic!("not locked");
        };
        assert_eq!(locked.sfn, 517);
        assert_eq!(locked.pci, Pci(42));
        assert_eq!(locked.cfo_hz, 120.0);
        assert_eq!(locked.attempts, 2);
        assert_eq!(locked.frame_start, 10 * 1920);
        assert_eq!(locked.mib.dl_bandwidth, DlBandwidth::N6);
        assert_eq!(sync.phase(), SyncPhase::Locked);
        assert_eq!(sync.last_sfn(), Some(517));
        assert_eq!(sync.scanned_subframes(), 11);
    }

    #[test]
    fn test_retry_phase_between_attempts() {
        let mut sync = SfnSynchronizer::new(params(), 3.0, 1000);
        let mut decoder = ScriptedDecoder::new(vec![]);
        let subframe = Subframe {
            index: 0,
            start: 0,
            samples: vec![Complex32::new(0.0, 0.0); 1920],
        };
        assert!(sync.on_subframe(&subframe, &mut decoder).is_none());
        assert_eq!(sync.phase(), SyncPhase::Retry);
        let next = Subframe { index: 1, ..subframe };
        assert!(sync.on_subframe(&next, &mut decoder).is_none());
        assert_eq!(sync.phase(), SyncPhase::AwaitingSubframeZero);
        assert_eq!(sync.attempts(), 1);
    }

    #[test]
    fn test_low_snr_times_out() {
        let mut sync = SfnSynchronizer::new(params(), 3.0, 50);
        let script = (0..10).map(|_| decoded(8, 0, 1.5)).collect();
        let mut decoder = ScriptedDecoder::new(script);

        let outcome = run(&mut sync, &mut decoder, 100).unwrap();
        assert_eq!(outcome, SyncOutcome::Failed(FailureReason::LowSnr));
        assert_eq!(outcome.reason(), Some("broadcast decode SNR too low"));
        assert_eq!(sync.scanned_subframes(), 50);
        assert_eq!(sync.attempts(), 5);
        assert_eq!(decoder.calls, 5);
    }

    #[test]
    fn test_not_found_times_out() {
        let mut sync = SfnSynchronizer::new(params(), 3.0, 25);
        let mut decoder = ScriptedDecoder::new(vec![]);
        let outcome = run(&mut sync, &mut decoder, 100).unwrap();
        assert_eq!(outcome, SyncOutcome::Failed(FailureReason::BroadcastNotFound));
        assert_eq!(sync.phase(), SyncPhase::Failed);

        // Terminal until reset
        let subframe = Subframe {
            index: 0,
            start: 0,
            samples: vec![Complex32::new(0.0, 0.0); 1920],
        };
        assert!(sync.on_subframe(&subframe, &mut decoder).is_none());
        sync.reset();
        assert_eq!(sync.phase(), SyncPhase::Idle);
        assert_eq!(sync.attempts(), 0);
    }

    #[test]
    fn test_invalid_mib_retried() {
        let mut sync = SfnSynchronizer::new(params(), 3.0, 1000);
        let bad = BchOutcome::Decoded {
            payload: Bytes::from_static(&[0xFF, 0xFF, 0xFF]),
            sfn_offset: 0,
            snr_db: 30.0,
        };
        let mut decoder = ScriptedDecoder::new(vec![bad, decoded(1023, 3, 12.0)]);
        let Some(SyncOutcome::Locked(locked)) = run(&mut sync, &mut decoder, 100) else {
            panic!("not locked");
        };
        assert_eq!(locked.sfn, 1023);
        assert_eq!(locked.attempts, 2);
    }

    #[test]
    fn test_sync_lost() {
        let mut sync = SfnSynchronizer::new(params(), 3.0, 1000);
        assert_eq!(sync.on_sync_lost(), SyncOutcome::Failed(FailureReason::SyncLost));
        assert_eq!(sync.phase(), SyncPhase::Failed);
    }
}
