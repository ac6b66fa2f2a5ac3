//! RF front-end capability
//!
//! The synchronization engine only ever pulls samples through this trait.
//! Gain is shared with the AGC task through a [`GainHandle`].

use crate::InterfaceError;
use num_complex::Complex32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by an RF front-end
#[derive(Error, Debug)]
pub enum RfError {
    #[error("Front-end is not streaming")]
    NotStreaming,

    #[error("Receive timed out")]
    Timeout,

    #[error("Expected {expected} channel buffers, got {got}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("Buffer of {len} samples cannot hold {count}")]
    BufferTooSmall { len: usize, count: usize },

    #[error("Sample stream exhausted")]
    EndOfStream,

    #[error("Unsupported setting: {0}")]
    Unsupported(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),
}

/// Receive gain register shared between the front-end and the AGC task
///
/// Stores the gain in dB as raw `f32` bits. Loads and stores are relaxed:
/// the register carries a single value with no ordering relationship to
/// the sample stream.
#[derive(Debug, Clone)]
pub struct GainHandle(Arc<AtomicU32>);

impl GainHandle {
    pub fn new(gain_db: f32) -> Self {
        Self(Arc::new(AtomicU32::new(gain_db.to_bits())))
    }

    /// Current gain in dB
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Replace the gain in dB
    pub fn set(&self, gain_db: f32) {
        self.0.store(gain_db.to_bits(), Ordering::Relaxed);
    }
}

impl Default for GainHandle {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Receive-only RF front-end
pub trait RfFrontend: Send {
    /// Fill `count` samples into each channel buffer.
    ///
    /// Returns the stream timestamp (in samples) of the first sample written.
    fn receive(&mut self, buffers: &mut [&mut [Complex32]], count: usize) -> Result<u64, RfError>;

    fn set_center_frequency(&mut self, freq_hz: f64) -> Result<(), RfError>;

    fn set_sample_rate(&mut self, rate_hz: f64) -> Result<(), RfError>;

    fn set_rx_gain(&mut self, gain_db: f32) -> Result<(), RfError>;

    fn start_streaming(&mut self) -> Result<(), RfError>;

    fn stop_streaming(&mut self) -> Result<(), RfError>;

    /// Handle to the receive gain register
    fn gain_handle(&self) -> GainHandle;
}

/// Validate a receive request against the channel buffers
pub fn check_buffers(
    buffers: &[&mut [Complex32]],
    expected_channels: usize,
    count: usize,
) -> Result<(), RfError> {
    if buffers.len() != expected_channels {
        return Err(RfError::ChannelMismatch {
            expected: expected_channels,
            got: buffers.len(),
        });
    }
    if let Some(short) = buffers.iter().find(|b| b.len() < count) {
        return Err(RfError::BufferTooSmall {
            len: short.len(),
            count,
        });
    }
    Ok(())
}
