// SPDX-License-Identifier: AGPL-3.0-only

//! Full-mode chunk header.
//!
//! ```text
//! word 1:  [31:24] chunk counter
//!          [23:16] payload size, low byte
//!          [11:8]  payload size, bits 8..11 (stored in place)
//!          [7:0]   0xAA fixed tag  | stream id (chunk counter)
//! word 2:  0x10AABB00               (ewidth = 0x10, 16-bit elements)
//! ```
//!
//! The payload size counts bytes after the 8-byte header and is always a
//! multiple of 4.

/// Bytes occupied by the two header words.
pub const CHUNK_HEADER_SIZE: u32 = 8;

/// Constant second header word.
pub const HEADER_WORD2: u32 = 0x10AA_BB00;

/// Low byte of word 1 in the [`HeaderLayout::FixedTag`] layout.
pub const FIXED_TAG: u8 = 0xAA;

/// Largest payload the 12-bit size field can describe.
pub const MAX_PAYLOAD_SIZE: u32 = 0xFFF;

/// Meaning of the low byte of header word 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HeaderLayout {
    /// Constant `0xAA`
    #[default]
    FixedTag,
    /// Chunk counter used as stream id
    StreamId,
}

/// Decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Low byte of word 1: `0xAA` or the stream id
    pub tag: u8,
    /// Payload bytes following the header
    pub payload_size: u32,
    /// Chunk counter (modulo 256)
    pub counter: u8,
    /// Second header word as received
    pub word2: u32,
}

impl ChunkHeader {
    /// Header for chunk number `counter` carrying `payload_size` bytes.
    ///
    /// Sizes above [`MAX_PAYLOAD_SIZE`] are truncated to the field width.
    #[allow(clippy::cast_possible_truncation)] // counter wraps at 256
    pub const fn new(layout: HeaderLayout, counter: u32, payload_size: u32) -> Self {
        let counter = (counter & 0xFF) as u8;
        let tag = match layout {
            HeaderLayout::FixedTag => FIXED_TAG,
            HeaderLayout::StreamId => counter,
        };
        Self {
            tag,
            payload_size: payload_size & MAX_PAYLOAD_SIZE,
            counter,
            word2: HEADER_WORD2,
        }
    }

    /// Encode into the two header words.
    pub const fn encode(&self) -> [u32; 2] {
        let size = self.payload_size;
        let word1 = self.tag as u32
            | (size & 0xF00)
            | ((size & 0xFF) << 16)
            | ((self.counter as u32) << 24);
        [word1, self.word2]
    }

    /// Decode from the two header words.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn decode(word1: u32, word2: u32) -> Self {
        Self {
            tag: (word1 & 0xFF) as u8,
            payload_size: (word1 & 0xF00) | ((word1 >> 16) & 0xFF),
            counter: (word1 >> 24) as u8,
            word2,
        }
    }

    /// Whether word 2 carries the expected constant.
    pub const fn word2_ok(&self) -> bool {
        self.word2 == HEADER_WORD2
    }

    /// Element width announced in word 2, in bits.
    pub const fn element_width(&self) -> u32 {
        self.word2 >> 24
    }

    /// Total chunk size in bytes, header included.
    pub const fn chunk_size(&self) -> u32 {
        self.payload_size + CHUNK_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_tag_word1_layout() {
        let h = ChunkHeader::new(HeaderLayout::FixedTag, 3, 456);
        let [w1, w2] = h.encode();
        // 456 = 0x1C8: bits 8..11 stay in place, low byte moves to 16..23
        assert_eq!(w1, 0xAA | 0x100 | (0xC8 << 16) | (3 << 24));
        assert_eq!(w2, HEADER_WORD2);
        assert_eq!(h.element_width(), 0x10);
    }

    #[test]
    fn stream_id_layout_repeats_counter() {
        let h = ChunkHeader::new(HeaderLayout::StreamId, 0x1_07, 16);
        assert_eq!(h.tag, 0x07);
        assert_eq!(h.counter, 0x07);
        assert_eq!(h.encode()[0] & 0xFF, 0x07);
    }

    #[test]
    fn decode_recovers_fields() {
        let h = ChunkHeader::new(HeaderLayout::FixedTag, 200, 0xABC);
        let [w1, w2] = h.encode();
        let d = ChunkHeader::decode(w1, w2);
        assert_eq!(d, h);
        assert!(d.word2_ok());
        assert_eq!(d.chunk_size(), 0xABC + 8);
    }
}
