//! Common Utilities
//!
//! Provides utility functions used across the UE receiver

use bytes::{Bytes, BytesMut, BufMut};
use tracing::trace;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// CRC-16 (CCITT polynomial) over a bit sequence, MSB first
pub fn crc16_bits(bits: &[u8]) -> u16 {
    const CRC16_POLY: u16 = 0x1021;
    let mut crc: u16 = 0;

    for &bit in bits {
        let feedback = ((crc >> 15) & 1) as u8 ^ (bit & 1);
        crc <<= 1;
        if feedback != 0 {
            crc ^= CRC16_POLY;
        }
    }

    crc
}

/// Pack bits into bytes (MSB first)
pub fn pack_bits(bits: &[u8]) -> Bytes {
    let mut bytes = BytesMut::with_capacity((bits.len() + 7) / 8);

    for chunk in bits.chunks(8) {
        let mut byte = 0u8;
        for (i, &bit) in chunk.iter().enumerate() {
            if bit != 0 {
                byte |= 1 << (7 - i);
            }
        }
        bytes.put_u8(byte);
    }

    bytes.freeze()
}

/// Unpack bytes into bits (MSB first)
pub fn unpack_bits(bytes: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);

    for &byte in bytes {
        for i in 0..8 {
            bits.push((byte >> (7 - i)) & 1);
        }
    }

    bits
}

/// Write the `width` least significant bits of `value` MSB first
pub fn push_bits(bits: &mut Vec<u8>, value: u32, width: usize) {
    for i in (0..width).rev() {
        bits.push(((value >> i) & 1) as u8);
    }
}

/// Read `width` bits MSB first starting at `offset`
pub fn read_bits(bits: &[u8], offset: usize, width: usize) -> u32 {
    bits[offset..offset + width]
        .iter()
        .fold(0u32, |acc, &b| (acc << 1) | (b & 1) as u32)
}

/// Round up to next power of 2
pub fn next_power_of_2(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }

    let rounded = n.next_power_of_two();
    trace!("Rounded {} up to power of two {}", n, rounded);
    rounded
}

/// Linear power to decibels, floored at -200 dB
pub fn power_to_db(power: f32) -> f32 {
    if power > 0.0 {
        10.0 * power.log10()
    } else {
        -200.0
    }
}

/// Decibels to linear amplitude
pub fn db_to_amplitude(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}
