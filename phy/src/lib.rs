//! UE Physical Layer Synchronization
//!
//! Cell search and downlink synchronization for LTE and NB-IoT receivers:
//! primary/secondary sequence detection, frequency and timing refinement,
//! subframe tracking and system frame number acquisition.

pub mod agc;
pub mod cell_search;
pub mod config;
pub mod correlator;
pub mod mib;
pub mod numerology;
pub mod ofdm;
pub mod peak;
pub mod refine;
pub mod sequence;
pub mod sfn;
pub mod sss;
pub mod synth;
pub mod tracker;
pub mod ue_sync;

use bytes::Bytes;
use common::types::{CyclicPrefix, DuplexMode, Pci};
use interfaces::RfError;
use num_complex::Complex32;
use thiserror::Error;

pub use cell_search::{CellSearchResult, FrameTiming, ScanOutcome};
pub use config::{RadioProfile, SyncConfig};
pub use sfn::{FailureReason, LockedReference, SyncOutcome};
pub use ue_sync::UeSync;

/// Errors raised by the synchronization engine
#[derive(Error, Debug)]
pub enum PhyError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    #[error("RF front-end error: {0}")]
    Rf(#[from] RfError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Processing error: {0}")]
    ProcessingError(String),
}

/// Cell parameters handed to the broadcast channel decoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellParams {
    pub pci: Pci,
    pub cp: CyclicPrefix,
    pub duplex: DuplexMode,
    pub fft_size: usize,
    /// Residual CFO already removed from the samples
    pub cfo_hz: f32,
}

/// Result of one broadcast channel decode attempt
#[derive(Debug, Clone, PartialEq)]
pub enum BchOutcome {
    Decoded {
        /// Packed 24-bit MIB
        payload: Bytes,
        /// Frame position inside the 40 ms broadcast period (0..3)
        sfn_offset: u8,
        snr_db: f32,
    },
    NotFound,
}

/// Broadcast channel (PBCH) decoder collaborator
///
/// Receives one full subframe 0 of time-domain samples, aligned to the
/// subframe boundary and frequency corrected.
pub trait BroadcastDecoder: Send {
    fn decode(&mut self, subframe: &[Complex32], params: &CellParams) -> BchOutcome;
}

/// Allocate a vector without aborting on allocation failure
pub(crate) fn try_alloc<T: Clone>(len: usize, value: T, what: &str) -> Result<Vec<T>, PhyError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| PhyError::AllocationFailure(format!("{} ({} elements): {}", what, len, e)))?;
    v.resize(len, value);
    Ok(v)
}
