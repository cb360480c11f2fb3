//! Synchronous bit-bang wire codec.
//!
//! The board is driven by an FT240X in synchronous bit-bang mode: every byte
//! written on the OUT pins clocks one byte back from the IN pins. The output
//! pattern sweeps a 4-bit address across the board's multiplexer while
//! alternately enabling the two sample switches. The two comparators are read
//! back on pins 1 and 4, one of them meaningful per slot.
//!
//! ```text
//! bit:   7      6      5      4      3      2      1      0
//! pin:   ADDR3  ADDR2  ADDR1  COMP2  ADDR0  SWEN1  COMP1  SWEN2
//! ```

use crate::error::{Error, Result};

/// Comparator read on odd slots.
pub const COMP1: u8 = 1;
/// Comparator read on even slots.
pub const COMP2: u8 = 4;
/// Sample enable driven on even slots.
pub const SWEN1: u8 = 2;
/// Sample enable driven on odd slots.
pub const SWEN2: u8 = 0;

pub const ADDR0: u8 = 3;
pub const ADDR1: u8 = 5;
pub const ADDR2: u8 = 6;
pub const ADDR3: u8 = 7;

/// Pin direction mask: every pin is an output except COMP1 and COMP2.
pub const OUTPUT_MASK: u8 = 0xFF & !(1 << COMP1) & !(1 << COMP2);

/// One full output cycle: 16 addresses × 2 enable phases × 16 sweeps.
pub const PATTERN_LEN: usize = 512;

/// Raw wire bytes consumed per decoded output byte.
pub const RAW_BYTES_PER_BYTE: usize = 8;

/// Map a 4-bit address onto the ADDR pins.
pub fn make_address(addr: u8) -> u8 {
    let mut value = 0u8;
    if addr & 1 != 0 {
        value |= 1 << ADDR0;
    }
    if addr & 2 != 0 {
        value |= 1 << ADDR1;
    }
    if addr & 4 != 0 {
        value |= 1 << ADDR2;
    }
    if addr & 8 != 0 {
        value |= 1 << ADDR3;
    }
    value
}

/// Build the 512-byte output pattern.
///
/// Even slots raise SWEN1, odd slots SWEN2; every slot carries `i mod 16` on
/// the address pins.
pub fn build_pattern() -> [u8; PATTERN_LEN] {
    let mut pattern = [0u8; PATTERN_LEN];
    for (i, frame) in pattern.iter_mut().enumerate() {
        let enable = if i & 1 == 1 { 1 << SWEN2 } else { 1 << SWEN1 };
        *frame = enable | make_address((i & 0x0f) as u8);
    }
    pattern
}

/// Decode raw wire bytes into `out`, one output byte per 8 input bytes.
///
/// Bits are shifted in MSB-first. Even positions of a group take COMP2, odd
/// positions take COMP1. Returns the number of bytes written.
///
/// `raw.len()` must be a multiple of 8 and `out` must hold `raw.len() / 8`
/// bytes; anything else means the caller lost track of the frame boundary.
pub fn decode_into(raw: &[u8], out: &mut [u8]) -> Result<usize> {
    if raw.len() % RAW_BYTES_PER_BYTE != 0 {
        return Err(Error::ProtocolDesync(format!(
            "partial decode group: {} raw bytes is not a multiple of {RAW_BYTES_PER_BYTE}",
            raw.len()
        )));
    }
    let n = raw.len() / RAW_BYTES_PER_BYTE;
    if out.len() < n {
        return Err(Error::ProtocolDesync(format!(
            "decode target holds {} bytes, need {n}",
            out.len()
        )));
    }

    for (group, slot) in raw.chunks_exact(RAW_BYTES_PER_BYTE).zip(out.iter_mut()) {
        *slot = decode_group(group);
    }
    Ok(n)
}

/// Decode raw wire bytes into a freshly allocated buffer.
pub fn decode(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; raw.len() / RAW_BYTES_PER_BYTE];
    decode_into(raw, &mut out)?;
    Ok(out)
}

#[inline]
fn decode_group(group: &[u8]) -> u8 {
    group.iter().enumerate().fold(0u8, |acc, (j, &val)| {
        let bit = if j & 1 == 1 {
            (val >> COMP1) & 1
        } else {
            (val >> COMP2) & 1
        };
        (acc << 1) | bit
    })
}
