//! Cell search over the synthetic downlink

use common::types::{CyclicPrefix, DuplexMode, Pci};
use interfaces::rf::{check_buffers, GainHandle, RfError, RfFrontend};
use num_complex::Complex32;
use phy::synth::{LoopbackBchDecoder, SynthConfig, SyntheticFrontend};
use phy::{RadioProfile, ScanOutcome, SyncConfig, UeSync};

/// Front-end that only ever delivers zeros
#[derive(Default)]
struct SilentFrontend {
    timestamp: u64,
    gain: GainHandle,
}

impl RfFrontend for SilentFrontend {
    fn receive(&mut self, buffers: &mut [&mut [Complex32]], count: usize) -> Result<u64, RfError> {
        check_buffers(buffers, 1, count)?;
        buffers[0][..count].fill(Complex32::new(0.0, 0.0));
        let timestamp = self.timestamp;
        self.timestamp += count as u64;
        Ok(timestamp)
    }

    fn set_center_frequency(&mut self, _freq_hz: f64) -> Result<(), RfError> {
        Ok(())
    }

    fn set_sample_rate(&mut self, _rate_hz: f64) -> Result<(), RfError> {
        Ok(())
    }

    fn set_rx_gain(&mut self, gain_db: f32) -> Result<(), RfError> {
        self.gain.set(gain_db);
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), RfError> {
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), RfError> {
        Ok(())
    }

    fn gain_handle(&self) -> GainHandle {
        self.gain.clone()
    }
}

fn scan(synth: SynthConfig, config: SyncConfig) -> ScanOutcome {
    let rf = SyntheticFrontend::new(synth).unwrap();
    let mut sync = UeSync::new(config, rf, LoopbackBchDecoder::new()).unwrap();
    sync.scan_for_cell().unwrap()
}

fn lte_config() -> SyncConfig {
    SyncConfig {
        max_frames: 16,
        min_valid_frames: 6,
        ..SyncConfig::default()
    }
}

#[test]
fn test_exact_identity_full_confidence() {
    // N_id_2 = 1, N_id_1 = 42
    let config = lte_config();
    let outcome = scan(
        SynthConfig {
            pci: 3 * 42 + 1,
            ..SynthConfig::default()
        },
        config.clone(),
    );
    let ScanOutcome::Found(cell) = outcome else {
        panic!("cell not found");
    };
    assert_eq!(cell.pci.nid1(), 42);
    assert_eq!(cell.pci.nid2(), 1);
    assert_eq!(cell.variant, 1);
    assert_eq!(cell.cp, CyclicPrefix::Normal);
    assert_eq!(cell.duplex, DuplexMode::Fdd);
    assert_eq!(cell.confidence, 1.0);
    assert_eq!(cell.num_records, config.min_valid_frames);
    assert_eq!(cell.timing.frame_start, 0);
}

#[test]
fn test_silence_exhausts_budget() {
    let config = SyncConfig {
        max_frames: 7,
        ..SyncConfig::default()
    };
    let mut sync = UeSync::new(config, SilentFrontend::default(), LoopbackBchDecoder::new()).unwrap();
    let outcome = sync.scan_for_cell().unwrap();
    assert_eq!(outcome, ScanOutcome::NoCellFound { windows: 7 });
    assert_eq!(sync.position(), 7 * 9600);
}

#[test]
fn test_clean_fdd_cell() {
    let outcome = scan(
        SynthConfig {
            pci: 101,
            sample_offset: 3333,
            ..SynthConfig::default()
        },
        lte_config(),
    );
    let ScanOutcome::Found(cell) = outcome else {
        panic!("cell not found");
    };
    assert_eq!(cell.profile, RadioProfile::Lte);
    assert_eq!(cell.pci, Pci(101));
    assert_eq!(cell.variant, 2);
    assert_eq!(cell.cp, CyclicPrefix::Normal);
    assert_eq!(cell.duplex, DuplexMode::Fdd);
    assert!(cell.confidence > 0.99);
    assert!(cell.cfo_hz.abs() < 20.0);
    assert_eq!(cell.timing.frame_start, 19200 - 3333);
}

#[test]
fn test_cfo_and_noise() {
    let outcome = scan(
        SynthConfig {
            pci: 302,
            cfo_hz: 600.0,
            snr_db: Some(5.0),
            seed: 7,
            sample_offset: 12345,
            ..SynthConfig::default()
        },
        lte_config(),
    );
    let ScanOutcome::Found(cell) = outcome else {
        panic!("cell not found");
    };
    assert_eq!(cell.pci, Pci(302));
    assert_eq!(cell.duplex, DuplexMode::Fdd);
    assert!((cell.cfo_hz - 600.0).abs() < 100.0, "CFO estimate {}", cell.cfo_hz);
    assert_eq!(cell.timing.frame_start, 19200 - 12345);
}

#[test]
fn test_tdd_extended_cp() {
    let outcome = scan(
        SynthConfig {
            pci: 44,
            cp: CyclicPrefix::Extended,
            duplex: DuplexMode::Tdd,
            sample_offset: 500,
            ..SynthConfig::default()
        },
        lte_config(),
    );
    let ScanOutcome::Found(cell) = outcome else {
        panic!("cell not found");
    };
    assert_eq!(cell.pci, Pci(44));
    assert_eq!(cell.cp, CyclicPrefix::Extended);
    assert_eq!(cell.duplex, DuplexMode::Tdd);
    assert_eq!(cell.timing.frame_start, 19200 - 500);
}

/// Confidence in the transmitted PCI, 0 when missed or mistaken
fn confidence_in(pci: u16, outcome: &ScanOutcome) -> f32 {
    match outcome {
        ScanOutcome::Found(cell) if cell.pci == Pci(pci) => cell.confidence,
        _ => 0.0,
    }
}

#[test]
fn test_confidence_falls_with_snr() {
    let synth = |snr_db, seed| SynthConfig {
        pci: 17,
        snr_db,
        seed,
        ..SynthConfig::default()
    };

    let ScanOutcome::Found(clean) = scan(synth(None, 1), lte_config()) else {
        panic!("noiseless cell not found");
    };
    assert_eq!(clean.pci, Pci(17));
    assert_eq!(clean.confidence, 1.0);

    let seeds = [1u64, 2, 3];
    let mut averages = Vec::new();
    for snr_db in [0.0f32, -3.0, -6.0, -9.0] {
        let total: f32 = seeds
            .iter()
            .map(|&seed| confidence_in(17, &scan(synth(Some(snr_db), seed), lte_config())))
            .sum();
        averages.push(total / seeds.len() as f32);
    }

    let mut previous = clean.confidence;
    for (snr_db, &average) in [0, -3, -6, -9].iter().zip(&averages) {
        assert!(
            average <= previous + 1e-6,
            "confidence rose to {} at {} dB (was {})",
            average,
            snr_db,
            previous
        );
        previous = average;
    }
    assert!(averages.iter().any(|&c| c < 1.0), "confidence never fell: {:?}", averages);

    let buried = scan(synth(Some(-30.0), 3), lte_config());
    assert_eq!(buried, ScanOutcome::NoCellFound { windows: 16 });
    assert_eq!(buried.reason(), Some("no cell found in scan window"));
}

#[test]
fn test_window_spanning_several_periods() {
    let config = SyncConfig {
        window_len: 2 * 9600,
        ..lte_config()
    };
    let ScanOutcome::Found(cell) = scan(
        SynthConfig {
            pci: 127,
            sample_offset: 2500,
            ..SynthConfig::default()
        },
        config,
    ) else {
        panic!("cell not found with a two half-frame window");
    };
    assert_eq!(cell.pci, Pci(127));
    assert_eq!(cell.confidence, 1.0);
    assert_eq!(cell.timing.frame_start, 19200 - 2500);

    let config = SyncConfig {
        profile: RadioProfile::Nbiot,
        window_len: 2 * 19200,
        max_frames: 8,
        min_valid_frames: 3,
        ..SyncConfig::default()
    };
    let ScanOutcome::Found(cell) = scan(
        SynthConfig {
            profile: RadioProfile::Nbiot,
            pci: 250,
            ..SynthConfig::default()
        },
        config,
    ) else {
        panic!("NB cell not found with a two-frame window");
    };
    assert_eq!(cell.pci, Pci(250));
}

#[test]
fn test_noise_only_exhausts_budget() {
    let config = SyncConfig {
        max_frames: 5,
        ..SyncConfig::default()
    };
    let outcome = scan(
        SynthConfig {
            snr_db: Some(-60.0),
            seed: 11,
            ..SynthConfig::default()
        },
        config,
    );
    assert_eq!(outcome, ScanOutcome::NoCellFound { windows: 5 });
}

#[test]
fn test_nbiot_cell() {
    let config = SyncConfig {
        profile: RadioProfile::Nbiot,
        max_frames: 8,
        min_valid_frames: 3,
        ..SyncConfig::default()
    };
    let outcome = scan(
        SynthConfig {
            profile: RadioProfile::Nbiot,
            pci: 250,
            ..SynthConfig::default()
        },
        config,
    );
    let ScanOutcome::Found(cell) = outcome else {
        panic!("NB cell not found");
    };
    assert_eq!(cell.profile, RadioProfile::Nbiot);
    assert_eq!(cell.pci, Pci(250));
    assert_eq!(cell.variant, 0);
    assert_eq!(cell.cp, CyclicPrefix::Normal);
}
