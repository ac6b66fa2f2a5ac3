//! Frame-number acquisition after a successful scan

use common::types::{DlBandwidth, Pci};
use interfaces::RfError;
use phy::synth::{LoopbackBchDecoder, SynthConfig, SyntheticFrontend};
use phy::{FailureReason, PhyError, ScanOutcome, SyncConfig, SyncOutcome, UeSync};

const FRAME_LEN: u64 = 19200;

fn engine(synth: SynthConfig, config: SyncConfig) -> UeSync<SyntheticFrontend, LoopbackBchDecoder> {
    let rf = SyntheticFrontend::new(synth).unwrap();
    UeSync::new(config, rf, LoopbackBchDecoder::new()).unwrap()
}

fn config() -> SyncConfig {
    SyncConfig {
        max_frames: 12,
        min_valid_frames: 4,
        ..SyncConfig::default()
    }
}

fn scan_and_sync(sync: &mut UeSync<SyntheticFrontend, LoopbackBchDecoder>) -> SyncOutcome {
    let ScanOutcome::Found(cell) = sync.scan_for_cell().unwrap() else {
        panic!("cell not found");
    };
    sync.synchronize(&cell).unwrap()
}

/// SFN carried by the frame starting at stream position `frame_start`
fn expected_sfn(synth: &SynthConfig, frame_start: u64) -> u16 {
    let frame = (frame_start + synth.sample_offset as u64) / FRAME_LEN;
    ((synth.start_sfn as u64 + frame) % 1024) as u16
}

#[test]
fn test_lock_clean_cell() {
    let synth = SynthConfig {
        pci: 77,
        start_sfn: 402,
        sample_offset: 5000,
        ..SynthConfig::default()
    };
    let mut sync = engine(synth.clone(), config());

    let SyncOutcome::Locked(locked) = scan_and_sync(&mut sync) else {
        panic!("not locked");
    };
    assert_eq!(locked.pci, Pci(77));
    assert_eq!(locked.mib.dl_bandwidth, DlBandwidth::N6);
    assert_eq!((locked.frame_start + 5000) % FRAME_LEN, 0);
    assert_eq!(locked.sfn, expected_sfn(&synth, locked.frame_start));
    assert_eq!(locked.attempts, 1);
    assert!(locked.snr_db >= 50.0);
}

#[test]
fn test_lock_with_cfo_and_noise() {
    let synth = SynthConfig {
        pci: 211,
        cfo_hz: -800.0,
        snr_db: Some(10.0),
        seed: 21,
        start_sfn: 1020,
        sample_offset: 777,
        ..SynthConfig::default()
    };
    let mut sync = engine(synth.clone(), config());

    let SyncOutcome::Locked(locked) = scan_and_sync(&mut sync) else {
        panic!("not locked");
    };
    assert_eq!(locked.pci, Pci(211));
    assert!((locked.cfo_hz + 800.0).abs() < 100.0);
    assert_eq!((locked.frame_start + 777) % FRAME_LEN, 0);
    // Wraps past 1023
    assert_eq!(locked.sfn, expected_sfn(&synth, locked.frame_start));
}

#[test]
fn test_corrupted_broadcast_fails() {
    let mut sync = engine(
        SynthConfig {
            pci: 9,
            corrupt_bch: true,
            ..SynthConfig::default()
        },
        SyncConfig {
            sfn_timeout_subframes: 100,
            ..config()
        },
    );
    let outcome = scan_and_sync(&mut sync);
    assert_eq!(outcome, SyncOutcome::Failed(FailureReason::BroadcastNotFound));
    assert_eq!(outcome.reason(), Some("broadcast channel not decoded within timeout"));
}

#[test]
fn test_snr_floor_fails_low_snr() {
    let mut sync = engine(
        SynthConfig {
            pci: 12,
            ..SynthConfig::default()
        },
        SyncConfig {
            // Above the loopback decoder's SNR cap
            min_snr_db: 70.0,
            sfn_timeout_subframes: 60,
            ..config()
        },
    );
    let outcome = scan_and_sync(&mut sync);
    assert_eq!(outcome, SyncOutcome::Failed(FailureReason::LowSnr));
    assert_eq!(outcome.reason(), Some("broadcast decode SNR too low"));
}

#[test]
fn test_stream_end_during_sync() {
    let rf = SyntheticFrontend::new(SynthConfig {
        corrupt_bch: true,
        ..SynthConfig::default()
    })
    .unwrap()
    .with_limit(20 * 9600);
    let mut sync = UeSync::new(config(), rf, LoopbackBchDecoder::new()).unwrap();

    let ScanOutcome::Found(cell) = sync.scan_for_cell().unwrap() else {
        panic!("cell not found");
    };
    assert!(matches!(
        sync.synchronize(&cell),
        Err(PhyError::Rf(RfError::EndOfStream))
    ));
}

#[test]
fn test_reset_and_rescan() {
    let synth = SynthConfig {
        pci: 330,
        start_sfn: 7,
        ..SynthConfig::default()
    };
    let mut sync = engine(synth.clone(), config());
    let SyncOutcome::Locked(first) = scan_and_sync(&mut sync) else {
        panic!("not locked");
    };

    sync.reset();
    let SyncOutcome::Locked(second) = scan_and_sync(&mut sync) else {
        panic!("not locked after reset");
    };
    assert_eq!(second.pci, first.pci);
    assert!(second.frame_start > first.frame_start);
    assert_eq!(second.sfn, expected_sfn(&synth, second.frame_start));
}
