//! Albor UE Cell Search Application
//!
//! Scans a sample source for an LTE or NB-IoT cell and, for LTE, acquires
//! the system frame number of the strongest cell found.

mod config;

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use config::{RfSource, UeConfig};
use interfaces::zmq_rf::{ZmqRfConfig, ZmqRxFrontend};
use interfaces::RfFrontend;
use phy::agc::{Agc, AgcConfig};
use phy::synth::{LoopbackBchDecoder, SyntheticFrontend};
use phy::{RadioProfile, ScanOutcome, SyncOutcome, UeSync};

/// Albor UE cell search
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (.yml, .toml or .json)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Sample source
    #[arg(long, value_enum)]
    source: Option<RfSource>,

    /// ZMQ device arguments (e.g., "rx_port=tcp://localhost:2000,base_srate=1.92e6")
    #[arg(long)]
    device_args: Option<String>,

    /// Downlink carrier frequency in MHz
    #[arg(long)]
    frequency_mhz: Option<f64>,

    /// Initial receive gain in dB
    #[arg(long)]
    rx_gain: Option<f32>,

    /// Radio profile (lte, nbiot)
    #[arg(long)]
    profile: Option<String>,

    /// Scan budget in windows
    #[arg(long)]
    max_frames: Option<usize>,

    /// PCI transmitted by the synthetic source
    #[arg(long)]
    synth_pci: Option<u16>,

    /// SNR of the synthetic source in dB
    #[arg(long)]
    synth_snr_db: Option<f32>,

    /// CFO of the synthetic source in Hz
    #[arg(long)]
    synth_cfo_hz: Option<f32>,

    /// Stop after the cell search
    #[arg(long)]
    scan_only: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    fn apply(&self, config: &mut UeConfig) -> Result<()> {
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if let Some(source) = self.source {
            config.rf.source = source;
        }
        if let Some(args) = &self.device_args {
            config.rf.device_args = args.clone();
        }
        if let Some(mhz) = self.frequency_mhz {
            config.rf.frequency_hz = mhz * 1e6;
        }
        if let Some(gain) = self.rx_gain {
            config.rf.rx_gain_db = gain;
        }
        if let Some(profile) = &self.profile {
            config.sync.profile = match profile.to_ascii_lowercase().as_str() {
                "lte" => RadioProfile::Lte,
                "nbiot" | "nb-iot" => RadioProfile::Nbiot,
                _ => return Err(anyhow!("Invalid profile: {}", profile)),
            };
        }
        if let Some(max_frames) = self.max_frames {
            config.sync.max_frames = max_frames;
            config.sync.min_valid_frames = config.sync.min_valid_frames.min(max_frames);
        }
        if let Some(pci) = self.synth_pci {
            config.rf.synthetic.pci = pci;
        }
        if let Some(snr) = self.synth_snr_db {
            config.rf.synthetic.snr_db = Some(snr);
        }
        if let Some(cfo) = self.synth_cfo_hz {
            config.rf.synthetic.cfo_hz = cfo;
        }
        Ok(())
    }
}

/// Final result of a run
#[derive(Debug, Serialize)]
struct Report {
    scan: ScanOutcome,
    sync: Option<SyncOutcome>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => UeConfig::from_file(path)?,
        None => UeConfig::default(),
    };
    args.apply(&mut config)?;
    config.validate()?;

    // Initialize logging
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting Albor UE cell search");
    if let Some(path) = &args.config {
        info!("Configuration file: {}", path);
    }
    info!("  Profile: {:?}", config.sync.profile);
    info!("  FFT size: {}", config.sync.fft_size);
    info!("  Frequency: {} MHz", config.rf.frequency_hz / 1e6);
    info!("  Source: {:?}", config.rf.source);

    let report = match config.rf.source {
        RfSource::Synthetic => {
            let rf = SyntheticFrontend::new(config.rf.synthetic.clone())?;
            run(rf, &config, args.scan_only).await?
        }
        RfSource::Zmq => {
            let zmq_config = ZmqRfConfig::from_device_args(&config.rf.device_args)?;
            info!("ZMQ configuration:");
            info!("  RX address: {}", zmq_config.rx_address);
            info!("  Sample rate: {} MHz", zmq_config.sample_rate / 1e6);
            run(ZmqRxFrontend::new(zmq_config), &config, args.scan_only).await?
        }
    };

    print_report(&report, args.json)?;
    Ok(())
}

/// Run the scan (and frame-number acquisition) on a blocking thread
async fn run<R: RfFrontend + 'static>(mut rf: R, config: &UeConfig, scan_only: bool) -> Result<Report> {
    let numerology = config.sync.numerology()?;
    rf.set_sample_rate(numerology.sample_rate())?;
    rf.set_center_frequency(config.rf.frequency_hz)?;
    rf.set_rx_gain(config.rf.rx_gain_db)?;

    let mut engine = UeSync::new(config.sync.clone(), rf, LoopbackBchDecoder::new())?;

    // Ctrl-C stops the engine at the next window boundary
    let cancel = engine.cancel_token();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let agc_handle = if config.sync.agc.enabled {
        Some(spawn_agc(config.sync.agc, config.rf.rx_gain_db, &engine))
    } else {
        None
    };

    let profile = config.sync.profile;
    let result = tokio::task::spawn_blocking(move || -> Result<Report> {
        let scan = engine.scan_for_cell()?;
        let sync = match (&scan, profile) {
            (ScanOutcome::Found(cell), RadioProfile::Lte) if !scan_only => Some(engine.synchronize(cell)?),
            (ScanOutcome::Found(_), RadioProfile::Nbiot) => {
                info!("Frame number acquisition is not available for NB-IoT");
                None
            }
            _ => None,
        };
        Ok(Report { scan, sync })
    })
    .await?;

    signal_handle.abort();
    if let Some(handle) = agc_handle {
        handle.abort();
    }
    result
}

/// Feed measured window power to the gain controller
fn spawn_agc<R: RfFrontend, D: phy::BroadcastDecoder>(
    config: AgcConfig,
    initial_gain_db: f32,
    engine: &UeSync<R, D>,
) -> tokio::task::JoinHandle<()> {
    let meter = engine.power_meter();
    let gain = engine.gain_handle();
    let mut agc = Agc::new(config, initial_gain_db);
    gain.set(agc.gain_db());
    info!("AGC enabled: target {} dB", config.target_power_db);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(5));
        loop {
            interval.tick().await;
            if let Some(power) = meter.latest() {
                let before = agc.gain_db();
                let after = agc.update(power);
                if after != before {
                    gain.set(after);
                }
            }
        }
    })
}

fn print_report(report: &Report, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    match &report.scan {
        ScanOutcome::Found(cell) => {
            info!("Cell search result:");
            info!("  PCI: {} (N_id_2 {})", cell.pci, cell.variant);
            info!("  Cyclic prefix: {:?}", cell.cp);
            info!("  Duplex: {:?}", cell.duplex);
            info!("  CFO: {:.1} Hz", cell.cfo_hz);
            info!("  Confidence: {:.2} over {} records", cell.confidence, cell.num_records);
        }
        ScanOutcome::NoCellFound { windows } => {
            warn!("{} ({} windows)", report.scan.reason().unwrap_or_default(), windows);
        }
    }

    match &report.sync {
        Some(SyncOutcome::Locked(locked)) => {
            info!("Synchronized:");
            info!("  SFN: {}", locked.sfn);
            info!(
                "  Bandwidth: {:?} ({} PRB)",
                locked.mib.dl_bandwidth,
                locked.mib.dl_bandwidth.nof_prb()
            );
            info!("  PHICH: {:?} / {:?}", locked.mib.phich_duration, locked.mib.phich_resource);
            info!("  Frame start: sample {}", locked.frame_start);
            info!("  Broadcast SNR: {:.1} dB after {} attempts", locked.snr_db, locked.attempts);
        }
        Some(outcome @ SyncOutcome::Failed(_)) => {
            error!("Synchronization failed: {}", outcome.reason().unwrap_or_default());
        }
        None => {}
    }
    Ok(())
}
