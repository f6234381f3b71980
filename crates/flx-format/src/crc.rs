// SPDX-License-Identifier: AGPL-3.0-only

//! CRC-20 over 32-bit chunk words.
//!
//! The CRC is bit-serial, MSB first, and matches the firmware checker:
//!
//! 1. register = `0xFFFFF`
//! 2. 20 zero-input shifts (right-shifting form) to pre-condition the register
//! 3. every data word shifted in MSB first, polynomial feedback on bit 19
//! 4. 20 more zero-input shifts to flush
//!
//! Two firmware generations use different generator polynomials, so every
//! caller has to know which [`CrcVariant`] a stream was encoded with.

/// CRC register width in bits.
pub const CRC_WIDTH: u32 = 20;
/// Mask selecting the CRC bits.
pub const CRC_MASK: u32 = (1 << CRC_WIDTH) - 1;
/// Register initial value.
pub const CRC_INITVAL: u32 = 0xF_FFFF;
/// Polynomial used by the legacy firmware.
pub const CRC_POLYNOM_1: u32 = 0xC_1ACF;
/// Polynomial used by current firmware.
pub const CRC_POLYNOM_2: u32 = 0x8_359F;

const TOP_BIT: u32 = 1 << (CRC_WIDTH - 1);

/// Generator polynomial selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CrcVariant {
    /// `0xC1ACF`, legacy firmware
    Legacy,
    /// `0x8359F`, current firmware
    #[default]
    New,
}

impl CrcVariant {
    /// Generator polynomial for this variant.
    pub const fn polynomial(self) -> u32 {
        match self {
            Self::Legacy => CRC_POLYNOM_1,
            Self::New => CRC_POLYNOM_2,
        }
    }
}

/// Incremental CRC-20 calculator.
///
/// ```
/// use flx_format::crc::{crc20, Crc20, CrcVariant};
///
/// let words = [0x0300_00AA, 0x10AA_BB00, 0x0302_0100];
/// let mut crc = Crc20::new(CrcVariant::New);
/// for w in words {
///     crc.update(w);
/// }
/// assert_eq!(crc.finish(), crc20(&words, CrcVariant::New));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Crc20 {
    reg: u32,
    poly: u32,
}

impl Crc20 {
    /// Start a new calculation with the pre-conditioned register.
    pub const fn new(variant: CrcVariant) -> Self {
        let poly = variant.polynomial();
        let mut reg = CRC_INITVAL;
        let mut k = 0;
        while k < CRC_WIDTH {
            reg = if reg & 1 != 0 {
                (reg >> 1) ^ (TOP_BIT | (poly >> 1))
            } else {
                reg >> 1
            };
            k += 1;
        }
        Self {
            reg: reg & CRC_MASK,
            poly,
        }
    }

    /// Shift one 32-bit word into the register, MSB first.
    pub fn update(&mut self, word: u32) {
        let mut reg = self.reg;
        for k in 1..=32 {
            let bit = (word >> (32 - k)) & 1;
            let feedback = reg & TOP_BIT != 0;
            reg = ((reg << 1) | bit) & CRC_MASK;
            if feedback {
                reg ^= self.poly;
            }
        }
        self.reg = reg & CRC_MASK;
    }

    /// Flush the register and return the 20-bit CRC.
    pub fn finish(self) -> u32 {
        let mut reg = self.reg;
        for _ in 0..CRC_WIDTH {
            let feedback = reg & TOP_BIT != 0;
            reg = (reg << 1) & CRC_MASK;
            if feedback {
                reg ^= self.poly;
            }
        }
        reg & CRC_MASK
    }
}

/// CRC-20 of a run of 32-bit words.
pub fn crc20(words: &[u32], variant: CrcVariant) -> u32 {
    let mut crc = Crc20::new(variant);
    for &w in words {
        crc.update(w);
    }
    crc.finish()
}

/// CRC-20 of link words, using only their low 32 bits.
///
/// Convenience for emulator buffers that hold 33-bit symbols in `u64`.
#[allow(clippy::cast_possible_truncation)]
pub fn crc20_symbols(words: &[u64], variant: CrcVariant) -> u32 {
    let mut crc = Crc20::new(variant);
    for &w in words {
        crc.update(w as u32);
    }
    crc.finish()
}
