//! ZMQ RF Receiver for IQ Sample Exchange
//!
//! Receive-only front-end for the srsRAN ZMQ sample link. The peer runs a
//! REP socket; every request (a single zero byte) is answered with a block of
//! raw little-endian `cf_t` samples.

use crate::rf::{check_buffers, GainHandle, RfError, RfFrontend};
use crate::InterfaceError;
use common::db_to_amplitude;
use num_complex::Complex32;
use std::collections::VecDeque;
use tracing::{debug, error, info, trace};
use zmq::{Context, Socket};

/// Default sample rate (6 PRB cell, 1.92 MHz)
pub const DEFAULT_SAMPLE_RATE: f64 = 1.92e6;

/// Default ZMQ port the transmitter serves samples on
pub const DEFAULT_RX_PORT: u16 = 2000;

/// Default receive timeout in milliseconds
pub const DEFAULT_RX_TIMEOUT_MS: i32 = 1000;

/// ZMQ RF receiver configuration
#[derive(Debug, Clone)]
pub struct ZmqRfConfig {
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Number of receive channels
    pub num_channels: usize,
    /// RX connection address
    pub rx_address: String,
    /// Receive gain in dB
    pub rx_gain: f32,
    /// Receive timeout in milliseconds
    pub rx_timeout_ms: i32,
}

impl Default for ZmqRfConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            num_channels: 1,
            rx_address: format!("tcp://localhost:{}", DEFAULT_RX_PORT),
            rx_gain: 0.0,
            rx_timeout_ms: DEFAULT_RX_TIMEOUT_MS,
        }
    }
}

impl ZmqRfConfig {
    /// Parse device arguments in srsRAN format
    /// Format: "key1=value1,key2=value2,..."
    /// Supports indexed port names: rx_port, rx_port0
    pub fn from_device_args(args: &str) -> Result<Self, InterfaceError> {
        let mut config = Self::default();

        for pair in args.split(',') {
            let parts: Vec<&str> = pair.trim().split('=').collect();
            if parts.len() != 2 {
                continue;
            }

            let key = parts[0].trim();
            let value = parts[1].trim();

            match key {
                "base_srate" => {
                    config.sample_rate = value.parse::<f64>()
                        .map_err(|_| InterfaceError::InvalidConfig("Invalid base_srate".to_string()))?;
                }
                "rx_gain" => {
                    config.rx_gain = value.parse::<f32>()
                        .map_err(|_| InterfaceError::InvalidConfig("Invalid rx_gain".to_string()))?;
                }
                "rx_timeout" => {
                    config.rx_timeout_ms = value.parse::<i32>()
                        .map_err(|_| InterfaceError::InvalidConfig("Invalid rx_timeout".to_string()))?;
                }
                "rx_port" | "rx_port0" => {
                    config.rx_address = value.to_string();
                }
                _ => {
                    trace!("Ignoring device argument {}", key);
                }
            }
        }

        if config.sample_rate <= 0.0 {
            return Err(InterfaceError::InvalidConfig("base_srate must be positive".to_string()));
        }

        Ok(config)
    }
}

/// Convert raw bytes to IQ samples (srsRAN format)
fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<Complex32>, InterfaceError> {
    if bytes.len() % 8 != 0 {
        return Err(InterfaceError::InvalidMessage);
    }

    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            let real = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            let imag = f32::from_le_bytes([c[4], c[5], c[6], c[7]]);
            Complex32::new(real, imag)
        })
        .collect())
}

/// ZMQ receive front-end
pub struct ZmqRxFrontend {
    config: ZmqRfConfig,
    context: Context,
    rx_socket: Option<Socket>,
    pending: VecDeque<Complex32>,
    rx_timestamp: u64,
    center_freq_hz: f64,
    gain: GainHandle,
}

impl ZmqRxFrontend {
    /// Create a new ZMQ receiver with its own context
    pub fn new(config: ZmqRfConfig) -> Self {
        Self::with_context(Context::new(), config)
    }

    /// Create a new ZMQ receiver sharing an existing context
    pub fn with_context(context: Context, config: ZmqRfConfig) -> Self {
        let gain = GainHandle::new(config.rx_gain);
        Self {
            config,
            context,
            rx_socket: None,
            pending: VecDeque::new(),
            rx_timestamp: 0,
            center_freq_hz: 0.0,
            gain,
        }
    }

    pub fn config(&self) -> &ZmqRfConfig {
        &self.config
    }

    pub fn center_frequency(&self) -> f64 {
        self.center_freq_hz
    }

    /// Request and receive one sample block
    fn fetch_block(&mut self) -> Result<(), RfError> {
        let rx_socket = self.rx_socket.as_ref().ok_or(RfError::NotStreaming)?;

        let dummy: &[u8] = &[0];
        rx_socket.send(dummy, 0).map_err(InterfaceError::from)?;
        trace!("Sent RX request (dummy byte: 0x00)");

        let bytes = match rx_socket.recv_bytes(0) {
            Ok(bytes) => bytes,
            Err(zmq::Error::EAGAIN) => {
                // REQ socket is stuck after a missed reply
                self.reconnect()?;
                return Err(RfError::Timeout);
            }
            Err(e) => {
                error!("Failed to receive RX samples: {}", e);
                return Err(InterfaceError::ZmqError(e).into());
            }
        };

        let samples = bytes_to_samples(&bytes)?;
        debug!("Received {} samples", samples.len());

        let scale = db_to_amplitude(self.gain.get());
        self.pending.extend(samples.into_iter().map(|s| s * scale));
        Ok(())
    }

    fn open_socket(&self) -> Result<Socket, InterfaceError> {
        let rx_socket = self.context.socket(zmq::REQ)?;
        rx_socket.set_rcvtimeo(self.config.rx_timeout_ms)?;
        rx_socket.set_sndtimeo(self.config.rx_timeout_ms)?;
        rx_socket.set_linger(0)?;
        rx_socket.connect(&self.config.rx_address)?;
        Ok(rx_socket)
    }

    fn reconnect(&mut self) -> Result<(), RfError> {
        debug!("Reconnecting RX socket to {}", self.config.rx_address);
        self.rx_socket = Some(self.open_socket()?);
        Ok(())
    }
}

impl RfFrontend for ZmqRxFrontend {
    fn receive(&mut self, buffers: &mut [&mut [Complex32]], count: usize) -> Result<u64, RfError> {
        check_buffers(buffers, self.config.num_channels, count)?;

        while self.pending.len() < count {
            self.fetch_block()?;
        }

        let timestamp = self.rx_timestamp;
        for (dst, src) in buffers[0][..count].iter_mut().zip(self.pending.drain(..count)) {
            *dst = src;
        }
        self.rx_timestamp += count as u64;

        Ok(timestamp)
    }

    fn set_center_frequency(&mut self, freq_hz: f64) -> Result<(), RfError> {
        // The sample link carries baseband only
        debug!("ZMQ center frequency set to {:.3} MHz", freq_hz / 1e6);
        self.center_freq_hz = freq_hz;
        Ok(())
    }

    fn set_sample_rate(&mut self, rate_hz: f64) -> Result<(), RfError> {
        if rate_hz != self.config.sample_rate {
            return Err(RfError::Unsupported(format!(
                "sample rate {} Hz, link runs at {} Hz",
                rate_hz, self.config.sample_rate
            )));
        }
        Ok(())
    }

    fn set_rx_gain(&mut self, gain_db: f32) -> Result<(), RfError> {
        self.gain.set(gain_db);
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<(), RfError> {
        info!("Connecting ZMQ RX socket (REQ) to {}", self.config.rx_address);
        info!("Sample rate: {} MHz", self.config.sample_rate / 1e6);
        self.rx_socket = Some(self.open_socket()?);
        self.pending.clear();
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<(), RfError> {
        if self.rx_socket.take().is_some() {
            info!("ZMQ RX socket closed");
        }
        Ok(())
    }

    fn gain_handle(&self) -> GainHandle {
        self.gain.clone()
    }
}
