//! Common Types for the LTE/NB-IoT UE receiver
//!
//! Defines fundamental types shared by the synchronization engine and its collaborators

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use std::fmt;

/// Physical Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-503)
    pub const MAX: u16 = 503;
    /// Number of physical-layer cell identity groups (N_id_1)
    pub const NUM_GROUPS: u16 = 168;
    /// Number of identities within a group (N_id_2)
    pub const NUM_SECTORS: u8 = 3;

    /// Create a new PCI with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Build a PCI from its group (N_id_1) and sector (N_id_2) parts
    pub fn from_parts(nid1: u16, nid2: u8) -> Option<Self> {
        if nid1 < Self::NUM_GROUPS && nid2 < Self::NUM_SECTORS {
            Some(Self(3 * nid1 + nid2 as u16))
        } else {
            None
        }
    }

    /// Cell identity group (N_id_1)
    pub fn nid1(&self) -> u16 {
        self.0 / 3
    }

    /// Identity within the group (N_id_2)
    pub fn nid2(&self) -> u8 {
        (self.0 % 3) as u8
    }
}

impl fmt::Display for Pci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cyclic prefix type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclicPrefix {
    #[default]
    Normal,
    Extended,
}

impl CyclicPrefix {
    /// OFDM symbols per 0.5 ms slot
    pub fn symbols_per_slot(&self) -> usize {
        match self {
            CyclicPrefix::Normal => 7,
            CyclicPrefix::Extended => 6,
        }
    }
}

/// Duplex mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplexMode {
    /// Frequency Division Duplex
    #[default]
    Fdd,
    /// Time Division Duplex
    Tdd,
}

/// Downlink transmission bandwidth as signalled in the MIB
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum DlBandwidth {
    /// 1.4 MHz
    N6 = 0,
    /// 3 MHz
    N15 = 1,
    /// 5 MHz
    N25 = 2,
    /// 10 MHz
    N50 = 3,
    /// 15 MHz
    N75 = 4,
    /// 20 MHz
    N100 = 5,
}

impl DlBandwidth {
    /// Number of resource blocks
    pub fn nof_prb(&self) -> u16 {
        match self {
            DlBandwidth::N6 => 6,
            DlBandwidth::N15 => 15,
            DlBandwidth::N25 => 25,
            DlBandwidth::N50 => 50,
            DlBandwidth::N75 => 75,
            DlBandwidth::N100 => 100,
        }
    }

    /// Bandwidth for a given FFT size, if it is a standard one
    pub fn from_fft_size(fft_size: usize) -> Option<Self> {
        match fft_size {
            128 => Some(DlBandwidth::N6),
            256 => Some(DlBandwidth::N15),
            512 => Some(DlBandwidth::N25),
            1024 => Some(DlBandwidth::N50),
            1536 => Some(DlBandwidth::N75),
            2048 => Some(DlBandwidth::N100),
            _ => None,
        }
    }
}
