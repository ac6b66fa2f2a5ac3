//! Primary sequence detection round trips: correlator and peak tracker

use num_complex::Complex32;
use phy::correlator::{CorrelationMode, Correlator};
use phy::numerology::Numerology;
use phy::peak::PeakTracker;
use phy::sequence::ReferenceKernel;

const PSR_THRESHOLD: f32 = 3.0;

/// Peak lag and PSR of `kernel` injected at `offset` into silence
fn detect(kernel: &ReferenceKernel, window_len: usize, offset: usize, mode: CorrelationMode) -> (isize, f32) {
    let mut window = vec![Complex32::new(0.0, 0.0); window_len];
    window[offset..offset + kernel.len()].copy_from_slice(kernel.samples());

    let mut correlator = Correlator::new(mode);
    let profile = correlator.correlate(&window, kernel.samples()).unwrap();
    assert_eq!(profile.len(), window_len + kernel.len() - 1);

    let mut tracker = PeakTracker::new(1.0, profile.len()).unwrap();
    let report = tracker.update(&profile, kernel.len() - 1).unwrap();
    (report.offset, report.psr)
}

#[test]
fn test_pss_round_trip_every_variant() {
    let num = Numerology::new(128).unwrap();
    for nid2 in 0..3u8 {
        let kernel = ReferenceKernel::pss(nid2, &num).unwrap();
        for offset in [0usize, 517, 4000, 9600 - 137] {
            for mode in [CorrelationMode::Power, CorrelationMode::Magnitude] {
                let (lag, psr) = detect(&kernel, 9600, offset, mode);
                assert!(
                    (lag - offset as isize).abs() <= 1,
                    "N_id_2 {} offset {}: lag {}",
                    nid2,
                    offset,
                    lag
                );
                if mode == CorrelationMode::Power {
                    assert!(psr > PSR_THRESHOLD, "N_id_2 {} offset {}: PSR {}", nid2, offset, psr);
                } else {
                    assert!(psr > 1.0);
                }
            }
        }
    }
}

#[test]
fn test_pss_variants_are_distinct() {
    let num = Numerology::new(128).unwrap();
    let kernels: Vec<ReferenceKernel> = (0..3).map(|nid2| ReferenceKernel::pss(nid2, &num).unwrap()).collect();
    let mut correlator = Correlator::new(CorrelationMode::Power);

    for (tx, sent) in kernels.iter().enumerate() {
        let mut window = vec![Complex32::new(0.0, 0.0); 2000];
        window[700..700 + sent.len()].copy_from_slice(sent.samples());

        let peaks: Vec<f32> = kernels
            .iter()
            .map(|k| {
                let profile = correlator.correlate(&window, k.samples()).unwrap();
                profile.iter().cloned().fold(0.0, f32::max)
            })
            .collect();
        for (rx, &peak) in peaks.iter().enumerate() {
            if rx != tx {
                assert!(peak < 0.5 * peaks[tx], "variant {} leaks into {}", tx, rx);
            }
        }
    }
}

#[test]
fn test_pss_larger_fft() {
    let num = Numerology::new(512).unwrap();
    let kernel = ReferenceKernel::pss(1, &num).unwrap();
    let (lag, psr) = detect(&kernel, 4 * 9600, 12345, CorrelationMode::Power);
    assert!((lag - 12345).abs() <= 1);
    assert!(psr > PSR_THRESHOLD);
}

#[test]
fn test_npss_round_trip() {
    let num = Numerology::new(128).unwrap();
    let kernel = ReferenceKernel::npss(&num).unwrap();
    for offset in [0usize, 3000, 19200 - kernel.len()] {
        let (lag, psr) = detect(&kernel, 19200, offset, CorrelationMode::Power);
        assert!((lag - offset as isize).abs() <= 1, "offset {}: lag {}", offset, lag);
        assert!(psr > PSR_THRESHOLD, "offset {}: PSR {}", offset, psr);
    }
}
