//! Cell Search
//!
//! Runs one primary-sequence search per variant (three PSS roots for LTE,
//! the single NPSS for NB-IoT) over consecutive analysis windows. Every
//! window with a clean correlation peak is refined (CFO, CP, duplex) and
//! the secondary sequence is resolved; the resulting candidate records are
//! voted into one cell identity with a confidence score.
//!
//! Each analysis buffer handed to [`CellSearch::process_window`] is the new
//! window preceded by `history_len` samples of older stream so that
//! lookback (CP, SSS, previous NSSS) never depends on window alignment.

use crate::config::{RadioProfile, SyncConfig};
use crate::correlator::Correlator;
use crate::numerology::Numerology;
use crate::peak::{PeakReport, PeakTracker};
use crate::refine::{classify_cp, kernel_cfo, CfoTracker};
use crate::sequence::ReferenceKernel;
use crate::sss::{NsssResolver, SssDetection, SssResolution, SssResolver};
use crate::PhyError;
use common::types::{CyclicPrefix, DuplexMode, Pci};
use num_complex::Complex32;
use serde::Serialize;
use tracing::{debug, info, trace};

/// Scan state of one primary-sequence variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Idle,
    Scanning,
    /// A record was added in the last window
    PeakFound,
    /// Scan budget exhausted before enough records
    Timeout,
    /// `min_valid_frames` records collected
    Done,
}

impl ScanState {
    pub fn is_finished(&self) -> bool {
        matches!(self, ScanState::Timeout | ScanState::Done)
    }
}

/// One detection in one analysis window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CandidateRecord {
    /// Primary variant (N_id_2 for LTE, 0 for NB-IoT)
    pub variant: u8,
    /// Peak index in the window's correlation profile
    pub peak_offset: usize,
    /// Instantaneous correlation at the peak
    pub peak: f32,
    pub psr: f32,
    /// Per-window CFO estimate, NaN when unavailable
    pub cfo_hz: f32,
    pub cp: CyclicPrefix,
    pub duplex: DuplexMode,
    /// N_id_1 (LTE) or N_id_ncell (NB-IoT)
    pub group_id: u16,
    pub pci: Pci,
    /// Half-frame parity (LTE) or ⌊nf/2⌋ mod 4 (NB-IoT)
    pub parity: u8,
    /// Secondary-sequence metric
    pub metric: f32,
    /// Absolute stream position of the sync anchor
    pub anchor: i64,
    /// Absolute stream position of the frame start (may precede the stream)
    pub frame_start: i64,
}

/// Location of radio frames in the sample stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameTiming {
    /// Absolute sample index of a subframe-0 boundary
    pub frame_start: u64,
    pub subframe_len: usize,
}

impl FrameTiming {
    pub fn new(frame_start: i64, numerology: &Numerology) -> Self {
        let frame_len = numerology.frame_len() as i64;
        Self {
            frame_start: frame_start.rem_euclid(frame_len) as u64,
            subframe_len: numerology.subframe_len(),
        }
    }

    /// First subframe boundary at or after `position` and its subframe index
    pub fn next_subframe(&self, position: u64) -> (u64, u8) {
        let sf = self.subframe_len as u64;
        let frames = crate::numerology::SUBFRAMES_PER_FRAME as u64;
        // Distance back to the most recent frame start
        let offset = (position as i64 - self.frame_start as i64).rem_euclid((sf * frames) as i64) as u64;
        let index = (offset + sf - 1) / sf;
        (position + index * sf - offset, (index % frames) as u8)
    }
}

/// Voted cell identity
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CellSearchResult {
    pub profile: RadioProfile,
    pub pci: Pci,
    /// Primary variant the cell was found with
    pub variant: u8,
    pub cp: CyclicPrefix,
    pub duplex: DuplexMode,
    /// Share of the variant's records that agree on the PCI
    pub confidence: f32,
    pub peak: f32,
    pub psr: f32,
    /// Mean of the available CFO estimates, 0 when none
    pub cfo_hz: f32,
    pub num_records: usize,
    pub timing: FrameTiming,
}

/// Result of a scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ScanOutcome {
    Found(CellSearchResult),
    NoCellFound { windows: usize },
}

impl ScanOutcome {
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            ScanOutcome::Found(_) => None,
            ScanOutcome::NoCellFound { .. } => Some("no cell found in scan window"),
        }
    }

    pub fn cell(&self) -> Option<&CellSearchResult> {
        match self {
            ScanOutcome::Found(cell) => Some(cell),
            ScanOutcome::NoCellFound { .. } => None,
        }
    }
}

/// Majority decision over a set of records
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vote {
    pub pci: Pci,
    pub cp: CyclicPrefix,
    pub duplex: DuplexMode,
    pub confidence: f32,
    pub peak: f32,
    pub psr: f32,
    pub cfo_hz: f32,
    /// Records agreeing with the winner
    pub count: usize,
    /// Most recent record of the winner
    pub latest: CandidateRecord,
}

/// Vote the records of one variant
///
/// The PCI with the most records wins (ties go to the first seen). CP and
/// duplex need a strict majority among the winner's records, otherwise
/// normal CP and FDD are reported.
pub fn vote(records: &[CandidateRecord]) -> Option<Vote> {
    let mut counts: Vec<(Pci, usize)> = Vec::new();
    for record in records {
        match counts.iter_mut().find(|(pci, _)| *pci == record.pci) {
            Some((_, count)) => *count += 1,
            None => counts.push((record.pci, 1)),
        }
    }

    let mut winner: Option<(Pci, usize)> = None;
    for &(pci, count) in counts.iter() {
        if winner.map_or(true, |(_, best)| count > best) {
            winner = Some((pci, count));
        }
    }
    let (pci, count) = winner?;

    let agreeing: Vec<&CandidateRecord> = records.iter().filter(|r| r.pci == pci).collect();
    let latest = **agreeing.last()?;

    let extended = agreeing.iter().filter(|r| r.cp == CyclicPrefix::Extended).count();
    let cp = if 2 * extended > count {
        CyclicPrefix::Extended
    } else {
        CyclicPrefix::Normal
    };
    let tdd = agreeing.iter().filter(|r| r.duplex == DuplexMode::Tdd).count();
    let duplex = if 2 * tdd > count {
        DuplexMode::Tdd
    } else {
        DuplexMode::Fdd
    };

    let peak = agreeing.iter().map(|r| r.peak).sum::<f32>() / count as f32;
    let psr = agreeing.iter().map(|r| r.psr).sum::<f32>() / count as f32;
    let cfos: Vec<f32> = agreeing.iter().map(|r| r.cfo_hz).filter(|c| !c.is_nan()).collect();
    let cfo_hz = if cfos.is_empty() {
        0.0
    } else {
        cfos.iter().sum::<f32>() / cfos.len() as f32
    };

    Some(Vote {
        pci,
        cp,
        duplex,
        confidence: count as f32 / records.len() as f32,
        peak,
        psr,
        cfo_hz,
        count,
        latest,
    })
}

/// Secondary-sequence resolver for the configured profile
enum Secondary {
    Lte(SssResolver),
    Nbiot(NsssResolver),
}

/// Shared, read-only search parameters
struct SearchContext {
    config: SyncConfig,
    numerology: Numerology,
    window_len: usize,
    /// Spacing of consecutive primary sequences
    period: usize,
    history_len: usize,
    secondary: Secondary,
}

impl SearchContext {
    /// Refine a peak whose kernel starts at `start` in `analysis`
    fn inspect(
        &self,
        analysis: &[Complex32],
        origin: i64,
        start: usize,
        kernel: &ReferenceKernel,
        report: &PeakReport,
        cfo_tracker: &mut CfoTracker,
    ) -> Result<Option<CandidateRecord>, PhyError> {
        let num = &self.numerology;
        let estimate = kernel_cfo(analysis, start, kernel, num.sample_rate());
        let cfo = cfo_tracker.update(estimate).unwrap_or(0.0);
        let anchor = start + kernel.anchor();

        let (cp, duplex, detection, pci, frame_start) = match &self.secondary {
            Secondary::Lte(resolver) => {
                let duplexes = if self.config.duplex_detection {
                    vec![DuplexMode::Fdd, DuplexMode::Tdd]
                } else {
                    vec![self.config.default_duplex]
                };
                let mut best: Option<(DuplexMode, CyclicPrefix, SssDetection)> = None;
                for duplex in duplexes {
                    // CP lookback follows the symbol layout of each duplex mode
                    let cp = if self.config.cp_detection {
                        classify_cp(analysis, anchor, num, duplex).decision()
                    } else {
                        self.config.default_cp
                    };
                    let resolution = resolver.resolve(analysis, anchor, kernel.variant(), duplex, cp, cfo)?;
                    if let SssResolution::Resolved(det) = resolution {
                        trace!(
                            "SSS {:?}/{:?}: N_id_1={} parity={} metric {:.3}",
                            duplex,
                            cp,
                            det.group_id,
                            det.parity,
                            det.metric
                        );
                        if best.map_or(true, |(_, _, b)| det.metric > b.metric) {
                            best = Some((duplex, cp, det));
                        }
                    }
                }
                let Some((duplex, cp, det)) = best else {
                    debug!("SSS unresolved for N_id_2={} at {}", kernel.variant(), anchor);
                    return Ok(None);
                };
                let Some(pci) = Pci::from_parts(det.group_id, kernel.variant()) else {
                    return Ok(None);
                };

                let half_frame_start = origin + anchor as i64 - num.pss_useful_offset(duplex, cp) as i64;
                let frame_start = if det.parity == 0 {
                    half_frame_start
                } else {
                    half_frame_start - num.half_frame_len() as i64
                };
                (cp, duplex, det, pci, frame_start)
            }
            Secondary::Nbiot(resolver) => {
                // NPSS sits in subframe 5, NSSS in subframe 9 of even frames:
                // try this frame's NSSS and the previous frame's
                let sf_len = num.subframe_len();
                let mut best: Option<SssDetection> = None;
                let candidates = [Some(start + 4 * sf_len), start.checked_sub(6 * sf_len)];
                for nsss_start in candidates.into_iter().flatten() {
                    if let SssResolution::Resolved(det) = resolver.resolve(analysis, nsss_start, cfo)? {
                        trace!("NSSS at {}: N_id={} metric {:.3}", nsss_start, det.group_id, det.metric);
                        if best.map_or(true, |b| det.metric > b.metric) {
                            best = Some(det);
                        }
                    }
                }
                let Some(det) = best else {
                    debug!("NSSS unresolved for NPSS at {}", start);
                    return Ok(None);
                };
                let Some(pci) = Pci::new(det.group_id) else {
                    return Ok(None);
                };

                let sf5_start =
                    origin + start as i64 - num.symbol_start(CyclicPrefix::Normal, kernel.first_symbol()) as i64;
                let frame_start = sf5_start - 5 * sf_len as i64;
                (CyclicPrefix::Normal, DuplexMode::Fdd, det, pci, frame_start)
            }
        };

        Ok(Some(CandidateRecord {
            variant: kernel.variant(),
            peak_offset: report.index,
            peak: report.instantaneous,
            psr: report.psr,
            cfo_hz: estimate,
            cp,
            duplex,
            group_id: detection.group_id,
            pci,
            parity: detection.parity,
            metric: detection.metric,
            anchor: origin + anchor as i64,
            frame_start,
        }))
    }
}

/// Sum `profile` modulo `period` into `out`
fn fold_profile(profile: &[f32], period: usize, out: &mut Vec<f32>) {
    out.clear();
    out.resize(period, 0.0);
    for chunk in profile.chunks(period) {
        for (o, &p) in out.iter_mut().zip(chunk) {
            *o += p;
        }
    }
}

/// Index of the strongest of `index`, `index + period`, ... in `profile`
fn strongest_repeat(profile: &[f32], index: usize, period: usize) -> usize {
    let mut best = index;
    for i in (index..profile.len()).step_by(period) {
        if profile[i] > profile[best] {
            best = i;
        }
    }
    best
}

/// Search session of one primary-sequence variant
struct VariantSearch {
    kernel: ReferenceKernel,
    correlator: Correlator,
    peak: PeakTracker,
    cfo: CfoTracker,
    profile: Vec<f32>,
    folded: Vec<f32>,
    state: ScanState,
    windows: usize,
    records: Vec<CandidateRecord>,
}

impl VariantSearch {
    fn new(kernel: ReferenceKernel, ctx: &SearchContext) -> Result<Self, PhyError> {
        let max_profile_len = ctx.config.max_profile_len(&ctx.numerology);
        Ok(Self {
            kernel,
            correlator: Correlator::new(ctx.config.correlation_mode),
            peak: PeakTracker::new(ctx.config.ema_alpha, max_profile_len)?,
            cfo: CfoTracker::new(ctx.config.cfo_ema_alpha),
            profile: Vec::new(),
            folded: Vec::new(),
            state: ScanState::Idle,
            windows: 0,
            records: Vec::new(),
        })
    }

    fn reset(&mut self) {
        self.peak.reset();
        self.cfo.reset();
        self.state = ScanState::Idle;
        self.windows = 0;
        self.records.clear();
    }

    fn process(&mut self, ctx: &SearchContext, analysis: &[Complex32], origin: i64) -> Result<(), PhyError> {
        if self.state.is_finished() {
            return Ok(());
        }
        self.state = ScanState::Scanning;
        self.windows += 1;

        // Correlate every kernel start inside the new window with full overlap
        let k = self.kernel.len();
        let segment_start = ctx.history_len + 1 - k;
        self.correlator
            .correlate_into(&analysis[segment_start..], self.kernel.samples(), &mut self.profile)?;
        let valid = &self.profile[k - 1..k - 1 + ctx.window_len];

        // Windows spanning several periods see one peak per period; fold so
        // the repeats add up instead of competing as side lobes
        let report = if ctx.window_len == ctx.period {
            self.peak.update(valid, 0)?
        } else {
            fold_profile(valid, ctx.period, &mut self.folded);
            let folded = self.peak.update(&self.folded, 0)?;
            let index = strongest_repeat(valid, folded.index, ctx.period);
            PeakReport {
                index,
                instantaneous: valid[index],
                offset: index as isize,
                ..folded
            }
        };

        debug!(
            "Variant {} window {}: peak {:.3e} at {} PSR {:.2}",
            self.kernel.variant(),
            self.windows,
            report.instantaneous,
            report.index,
            report.psr
        );

        if report.psr >= ctx.config.psr_threshold {
            let start = segment_start + report.index;
            if let Some(record) = ctx.inspect(analysis, origin, start, &self.kernel, &report, &mut self.cfo)? {
                debug!(
                    "Variant {} record: PCI {} {:?}/{:?} CFO {:.1} Hz",
                    record.variant, record.pci, record.cp, record.duplex, record.cfo_hz
                );
                if self.records.len() < ctx.config.max_frames {
                    self.records.push(record);
                }
                self.state = if self.records.len() >= ctx.config.min_valid_frames {
                    ScanState::Done
                } else {
                    ScanState::PeakFound
                };
            }
        }

        if self.state != ScanState::Done && self.windows >= ctx.config.max_frames {
            debug!(
                "Variant {} timed out with {} records",
                self.kernel.variant(),
                self.records.len()
            );
            self.state = ScanState::Timeout;
        }
        Ok(())
    }
}

/// Cell-search aggregator over all primary variants
pub struct CellSearch {
    ctx: SearchContext,
    variants: Vec<VariantSearch>,
    windows: usize,
}

impl CellSearch {
    pub fn new(config: &SyncConfig) -> Result<Self, PhyError> {
        config.validate()?;
        let numerology = config.numerology()?;

        let (kernels, secondary) = match config.profile {
            RadioProfile::Lte => {
                let kernels = (0..Pci::NUM_SECTORS)
                    .map(|nid2| ReferenceKernel::pss(nid2, &numerology))
                    .collect::<Result<Vec<_>, _>>()?;
                let resolver = SssResolver::new(numerology, config.sss_strategy, config.sss_equalization)?;
                (kernels, Secondary::Lte(resolver))
            }
            RadioProfile::Nbiot => (
                vec![ReferenceKernel::npss(&numerology)?],
                Secondary::Nbiot(NsssResolver::new(numerology)?),
            ),
        };

        let ctx = SearchContext {
            config: config.clone(),
            numerology,
            window_len: config.window_len(&numerology),
            period: config.search_period(&numerology),
            history_len: config.history_len(&numerology),
            secondary,
        };
        let variants = kernels
            .into_iter()
            .map(|kernel| VariantSearch::new(kernel, &ctx))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Cell search ready: {:?}, FFT {}, window {} samples, {} variant(s)",
            config.profile,
            numerology.fft_size(),
            ctx.window_len,
            variants.len()
        );

        Ok(Self {
            ctx,
            variants,
            windows: 0,
        })
    }

    pub fn numerology(&self) -> &Numerology {
        &self.ctx.numerology
    }

    pub fn window_len(&self) -> usize {
        self.ctx.window_len
    }

    pub fn history_len(&self) -> usize {
        self.ctx.history_len
    }

    /// Windows processed since the last reset
    pub fn windows(&self) -> usize {
        self.windows
    }

    pub fn states(&self) -> Vec<ScanState> {
        self.variants.iter().map(|v| v.state).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.variants.iter().all(|v| v.state.is_finished())
    }

    /// Clear every session (smoothed profiles, CFO averages, records)
    pub fn reset(&mut self) {
        for variant in self.variants.iter_mut() {
            variant.reset();
        }
        self.windows = 0;
    }

    /// Process one analysis buffer (`history_len` old samples + one window)
    ///
    /// `origin` is the absolute stream position of `analysis[0]`. Returns
    /// true once every variant has finished.
    pub fn process_window(&mut self, analysis: &[Complex32], origin: i64) -> Result<bool, PhyError> {
        let expected = self.ctx.history_len + self.ctx.window_len;
        if analysis.len() != expected {
            return Err(PhyError::ProcessingError(format!(
                "Analysis buffer of {} samples, expected {}",
                analysis.len(),
                expected
            )));
        }

        self.windows += 1;
        for variant in self.variants.iter_mut() {
            variant.process(&self.ctx, analysis, origin)?;
        }
        Ok(self.is_finished())
    }

    /// Vote every variant and keep the one with the strongest average peak
    pub fn outcome(&self) -> ScanOutcome {
        let mut best: Option<(Vote, u8, usize)> = None;
        for variant in self.variants.iter() {
            let Some(v) = vote(&variant.records) else {
                continue;
            };
            debug!(
                "Variant {} vote: PCI {} confidence {:.2} peak {:.3e} ({} records)",
                variant.kernel.variant(),
                v.pci,
                v.confidence,
                v.peak,
                variant.records.len()
            );
            if best.as_ref().map_or(true, |(b, _, _)| v.peak > b.peak) {
                best = Some((v, variant.kernel.variant(), variant.records.len()));
            }
        }

        let Some((v, variant, num_records)) = best else {
            info!("No cell found after {} windows", self.windows);
            return ScanOutcome::NoCellFound { windows: self.windows };
        };

        let result = CellSearchResult {
            profile: self.ctx.config.profile,
            pci: v.pci,
            variant,
            cp: v.cp,
            duplex: v.duplex,
            confidence: v.confidence,
            peak: v.peak,
            psr: v.psr,
            cfo_hz: v.cfo_hz,
            num_records,
            timing: FrameTiming::new(v.latest.frame_start, &self.ctx.numerology),
        };
        info!(
            "Cell found: PCI {} {:?}/{:?} confidence {:.2} CFO {:.1} Hz",
            result.pci, result.cp, result.duplex, result.confidence, result.cfo_hz
        );
        ScanOutcome::Found(result)
    }
}
