//! Master Information Block
//!
//! LTE MIB content according to 3GPP TS 36.331 (24 bits):
//! dl-Bandwidth (3), phich-Duration (1), phich-Resource (2),
//! systemFrameNumber MSBs (8), spare (10).

use crate::PhyError;
use bytes::Bytes;
use common::types::DlBandwidth;
use common::utils::{pack_bits, push_bits, read_bits, unpack_bits};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// MIB size in bits
pub const MIB_BITS: usize = 24;

/// PHICH duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum PhichDuration {
    Normal = 0,
    Extended = 1,
}

/// PHICH resource Ng
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum PhichResource {
    OneSixth = 0,
    Half = 1,
    One = 2,
    Two = 3,
}

/// Master Information Block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mib {
    /// Downlink bandwidth (3 bits)
    pub dl_bandwidth: DlBandwidth,
    /// PHICH duration (1 bit)
    pub phich_duration: PhichDuration,
    /// PHICH resource (2 bits)
    pub phich_resource: PhichResource,
    /// Eight most significant bits of the SFN
    pub sfn_msb: u8,
}

impl Mib {
    /// MIB for a cell of the given bandwidth transmitting frame `sfn`
    pub fn new(dl_bandwidth: DlBandwidth, sfn: u16) -> Self {
        Self {
            dl_bandwidth,
            phich_duration: PhichDuration::Normal,
            phich_resource: PhichResource::One,
            sfn_msb: ((sfn % 1024) >> 2) as u8,
        }
    }

    /// Encode MIB to bits (24 bits total)
    pub fn encode_bits(&self) -> Vec<u8> {
        let mut bits = Vec::with_capacity(MIB_BITS);
        push_bits(&mut bits, self.dl_bandwidth.to_u32().unwrap_or(0), 3);
        push_bits(&mut bits, self.phich_duration.to_u32().unwrap_or(0), 1);
        push_bits(&mut bits, self.phich_resource.to_u32().unwrap_or(0), 2);
        push_bits(&mut bits, self.sfn_msb as u32, 8);
        // Spare (10 bits)
        push_bits(&mut bits, 0, 10);
        bits
    }

    /// Encode MIB to its 3-byte packed form
    pub fn encode(&self) -> Bytes {
        pack_bits(&self.encode_bits())
    }

    /// Decode MIB from bits
    pub fn decode_bits(bits: &[u8]) -> Result<Self, PhyError> {
        if bits.len() < MIB_BITS {
            return Err(PhyError::ProcessingError(format!(
                "MIB must be {} bits, got {}",
                MIB_BITS,
                bits.len()
            )));
        }

        let bw_code = read_bits(bits, 0, 3);
        let dl_bandwidth = DlBandwidth::from_u32(bw_code)
            .ok_or_else(|| PhyError::ProcessingError(format!("Invalid dl-Bandwidth code {}", bw_code)))?;
        let phich_duration = PhichDuration::from_u32(read_bits(bits, 3, 1))
            .ok_or_else(|| PhyError::ProcessingError("Invalid phich-Duration".to_string()))?;
        let phich_resource = PhichResource::from_u32(read_bits(bits, 4, 2))
            .ok_or_else(|| PhyError::ProcessingError("Invalid phich-Resource".to_string()))?;
        let sfn_msb = read_bits(bits, 6, 8) as u8;

        Ok(Self {
            dl_bandwidth,
            phich_duration,
            phich_resource,
            sfn_msb,
        })
    }

    /// Decode MIB from its packed form
    pub fn decode(payload: &[u8]) -> Result<Self, PhyError> {
        Self::decode_bits(&unpack_bits(payload))
    }

    /// Full SFN given the frame position inside the 40 ms broadcast period
    pub fn sfn(&self, sfn_offset: u8) -> u16 {
        (((self.sfn_msb as u16) << 2) + sfn_offset as u16) % 1024
    }
}
