//! RF Front-End Interfaces Library
//!
//! This crate provides the receive-side RF capability used by the UE
//! synchronization engine, plus a ZeroMQ front-end compatible with the
//! srsRAN sample link.

pub mod rf;
pub mod zmq_rf;

use thiserror::Error;

pub use rf::{GainHandle, RfError, RfFrontend};

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("ZMQ error: {0}")]
    ZmqError(#[from] zmq::Error),

    #[error("Invalid message format")]
    InvalidMessage,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
