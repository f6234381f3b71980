// SPDX-License-Identifier: AGPL-3.0-only

//! Full-mode control symbols.
//!
//! Every word on a full-mode link is a 33-bit value: bit 32 flags a
//! K-character, the low 32 bits carry either data or the 8-bit K-code.
//! Words are held in `u64` so that the marker bit survives.
//!
//! ```text
//! IDLE = K28.5 (0xBC)   SOP = K28.1 (0x3C)   EOP = K28.6 (0xDC)
//! SOB  = K28.2 (0x5C)   EOB = K28.3 (0x7C)
//! ```

/// Marker bit separating K-characters from data words.
pub const KCHAR_FLAG: u64 = 1 << 32;

/// Comma / idle filler.
pub const IDLE: u64 = KCHAR_FLAG | 0xBC;
/// Start of chunk.
pub const SOP: u64 = KCHAR_FLAG | 0x3C;
/// End of chunk. Bits 8..28 carry the chunk CRC-20.
pub const EOP: u64 = KCHAR_FLAG | 0xDC;
/// Start of a busy bracket.
pub const SOB: u64 = KCHAR_FLAG | 0x5C;
/// End of a busy bracket.
pub const EOB: u64 = KCHAR_FLAG | 0x7C;

/// Bit offset of the CRC inside an EOP symbol.
pub const EOP_CRC_SHIFT: u32 = 8;

/// Decoded meaning of one link word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// Idle filler
    Idle,
    /// Start of chunk
    Sop,
    /// End of chunk with the CRC it carries
    Eop {
        /// CRC-20 carried in the EOP word
        crc: u32,
    },
    /// Start of busy
    Sob,
    /// End of busy
    Eob,
    /// 32-bit data word
    Data(u32),
    /// K-character with an unknown code
    Unknown(u64),
}

impl Symbol {
    /// Classify a raw 33-bit link word.
    #[allow(clippy::cast_possible_truncation)] // data words are the low 32 bits
    pub const fn decode(word: u64) -> Self {
        if word & KCHAR_FLAG == 0 {
            return Self::Data(word as u32);
        }
        match word & 0xFF {
            0xBC => Self::Idle,
            0x3C => Self::Sop,
            0xDC => Self::Eop {
                crc: ((word >> EOP_CRC_SHIFT) & crate::crc::CRC_MASK as u64) as u32,
            },
            0x5C => Self::Sob,
            0x7C => Self::Eob,
            _ => Self::Unknown(word),
        }
    }

    /// Whether the word is a K-character.
    pub const fn is_kchar(word: u64) -> bool {
        word & KCHAR_FLAG != 0
    }
}

/// Build an EOP symbol carrying `crc`.
pub const fn eop_with_crc(crc: u32) -> u64 {
    EOP | ((crc as u64) << EOP_CRC_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kchars_carry_marker_bit() {
        for k in [IDLE, SOP, EOP, SOB, EOB] {
            assert!(Symbol::is_kchar(k));
        }
        assert!(!Symbol::is_kchar(0xBC));
    }

    #[test]
    fn eop_round_trips_crc() {
        let word = eop_with_crc(0xABCDE);
        assert_eq!(Symbol::decode(word), Symbol::Eop { crc: 0xABCDE });
    }

    #[test]
    fn data_word_is_not_confused_with_kchar_code() {
        assert_eq!(Symbol::decode(0x3C), Symbol::Data(0x3C));
        assert_eq!(Symbol::decode(SOP), Symbol::Sop);
        assert_eq!(Symbol::decode(KCHAR_FLAG | 0x11), Symbol::Unknown(KCHAR_FLAG | 0x11));
    }
}
