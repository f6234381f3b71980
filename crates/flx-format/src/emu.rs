// SPDX-License-Identifier: AGPL-3.0-only

//! Frame synthesis for the card's front-end emulator.
//!
//! The emulator RAM holds a fixed loop of full-mode symbols that the card
//! replays on every link. [`synthesize`] fills such a buffer:
//!
//! ```text
//! IDLE IDLE | SOP hdr1 hdr2 payload.. EOP+crc [IDLE x idle_gap] | SOP ..  | IDLE..
//! ```
//!
//! The number of chunks aimed for is
//! `(len - 2) / (1 + chunk_size/4 + 1 + idle_gap)`. Anything left over is
//! padded with IDLE.
//!
//! [`emu_config_lines`] renders the buffer as the register write sequence
//! used to load the emulator RAM.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::chunk::{ChunkHeader, HeaderLayout, CHUNK_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::crc::{crc20_symbols, CrcVariant};
use crate::error::{FormatError, Result};
use crate::symbols::{eop_with_crc, EOB, IDLE, SOB, SOP};

/// Payload fill pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Pattern {
    /// Byte counter restarting at 0 in every chunk
    #[default]
    Incremental,
    /// `0xAA55AA55`
    Alternating,
    /// `0xFFFFFFFF`
    AllOnes,
    /// `0x00000000`
    AllZeros,
}

impl Pattern {
    /// Map the numeric pattern id used on the command line.
    ///
    /// Unknown ids fall back to [`Pattern::Incremental`].
    pub const fn from_id(id: u32) -> Self {
        match id {
            1 => Self::Alternating,
            2 => Self::AllOnes,
            3 => Self::AllZeros,
            _ => Self::Incremental,
        }
    }

    /// Numeric id of this pattern.
    pub const fn id(self) -> u32 {
        match self {
            Self::Incremental => 0,
            Self::Alternating => 1,
            Self::AllOnes => 2,
            Self::AllZeros => 3,
        }
    }

    /// Payload word `i` of a chunk.
    #[allow(clippy::cast_possible_truncation)] // counter bytes wrap at 256
    pub const fn word(self, i: u32) -> u32 {
        match self {
            Self::Alternating => 0xAA55_AA55,
            Self::AllOnes => 0xFFFF_FFFF,
            Self::AllZeros => 0,
            Self::Incremental => {
                let c = (i * 4) as u8;
                u32::from_le_bytes([
                    c,
                    c.wrapping_add(1),
                    c.wrapping_add(2),
                    c.wrapping_add(3),
                ])
            }
        }
    }
}

/// Emulator frame options.
///
/// Defaults: 464-byte chunks, incremental pattern, one idle between
/// chunks, new CRC polynomial, fixed-tag header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmuOptions {
    /// Chunk size in bytes, header included
    pub chunk_size: u32,
    /// Payload pattern
    pub pattern: Pattern,
    /// IDLE symbols between chunks
    pub idle_gap: u32,
    /// Randomise each chunk size between `chunk_size/2` and `chunk_size`
    pub random_size: bool,
    /// CRC polynomial
    pub crc: CrcVariant,
    /// Header word 1 low-byte layout
    pub layout: HeaderLayout,
    /// Bracket the idles after the first chunk with SOB/EOB
    pub busy: bool,
    /// Drop the SOP of chunk 2
    pub omit_sop: bool,
    /// Drop the EOP of chunk 2
    pub omit_eop: bool,
    /// Corrupt the CRC of chunk 3
    pub crc_error: bool,
    /// Seed for random chunk sizes
    pub seed: u64,
}

impl Default for EmuOptions {
    fn default() -> Self {
        Self {
            chunk_size: 464,
            pattern: Pattern::Incremental,
            idle_gap: 1,
            random_size: false,
            crc: CrcVariant::New,
            layout: HeaderLayout::FixedTag,
            busy: false,
            omit_sop: false,
            omit_eop: false,
            crc_error: false,
            seed: 0,
        }
    }
}

impl EmuOptions {
    /// Check the chunk size can be framed.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk cannot hold its header, is not a whole
    /// number of words, or its payload overflows the 12-bit size field.
    pub fn validate(&self) -> Result<()> {
        let size = self.chunk_size;
        if size < CHUNK_HEADER_SIZE {
            return Err(FormatError::ChunkTooSmall {
                size,
                min: CHUNK_HEADER_SIZE,
            });
        }
        if size % 4 != 0 {
            return Err(FormatError::ChunkMisaligned { size });
        }
        if size - CHUNK_HEADER_SIZE > MAX_PAYLOAD_SIZE {
            return Err(FormatError::ChunkTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE + CHUNK_HEADER_SIZE,
            });
        }
        Ok(())
    }

    /// Number of chunks a buffer of `len` symbols is expected to hold.
    pub fn max_chunk_count(&self, len: usize) -> usize {
        let per_chunk = 1 + self.chunk_size as usize / 4 + 1 + self.idle_gap as usize;
        len.saturating_sub(2) / per_chunk
    }

    /// File name used for a generated emulator configuration.
    pub fn config_file_name(&self, base: &str) -> String {
        format!(
            "{base}_{}_{}_{}",
            self.chunk_size,
            self.idle_gap,
            self.pattern.id()
        )
    }
}

/// Stateful frame synthesiser.
///
/// Holds the RNG so consecutive buffers get fresh random chunk sizes.
#[derive(Debug)]
pub struct FrameGenerator {
    options: EmuOptions,
    rng: StdRng,
}

impl FrameGenerator {
    /// Create a generator seeded from `options.seed`.
    pub fn new(options: EmuOptions) -> Self {
        let rng = StdRng::seed_from_u64(options.seed);
        Self { options, rng }
    }

    /// Options in use.
    pub fn options(&self) -> &EmuOptions {
        &self.options
    }

    /// Fill `buffer` with a chunk stream.
    ///
    /// Returns `false` if fewer chunks than [`EmuOptions::max_chunk_count`]
    /// were written or a chunk had to be abandoned for lack of room. Invalid
    /// options leave a buffer of IDLE symbols and also return `false`.
    pub fn synthesize(&mut self, buffer: &mut [u64]) -> bool {
        buffer.fill(IDLE);
        if self.options.validate().is_err() {
            return false;
        }

        let len = buffer.len();
        let max_chunks = self.options.max_chunk_count(len);
        let mut index = 2.min(len);
        let mut counter = 0usize;
        let mut success = true;

        while index < len && counter < max_chunks {
            let chunk_size = self.next_chunk_size();
            let chunk_words = chunk_size as usize / 4;

            if index + 1 + chunk_words + 1 >= len {
                // no room: everything from here stays IDLE
                success = false;
                break;
            }
            index = self.write_chunk(buffer, index, counter, chunk_size);
            counter += 1;
        }

        success && counter >= max_chunks
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn next_chunk_size(&mut self) -> u32 {
        let req = self.options.chunk_size;
        if !self.options.random_size || req <= CHUNK_HEADER_SIZE {
            return req;
        }
        let sz = (req + 1) / 2;
        let r: f64 = self.rng.gen_range(0.0..=1.0);
        let d = 0.5 * f64::from(1 - (req & 1));
        ((sz + (f64::from(sz) * r + d) as u32 + 3) / 4) * 4
    }

    /// Write one chunk starting at `index`, return the index after it.
    ///
    /// The caller guarantees SOP through EOP fit; the gap symbols that
    /// follow may run off the end and are dropped.
    #[allow(clippy::cast_possible_truncation)] // counter fits the 8-bit header field
    fn write_chunk(&self, buffer: &mut [u64], mut index: usize, counter: usize, chunk_size: u32) -> usize {
        let opts = &self.options;
        let len = buffer.len();

        buffer[index] = SOP;
        index += 1;
        if opts.omit_sop && counter == 2 {
            index -= 1;
        }

        let start = index;
        let payload_size = chunk_size - CHUNK_HEADER_SIZE;
        let header = ChunkHeader::new(opts.layout, counter as u32, payload_size);
        for word in header.encode() {
            buffer[index] = u64::from(word);
            index += 1;
        }
        for i in 0..payload_size / 4 {
            buffer[index] = u64::from(opts.pattern.word(i));
            index += 1;
        }

        let mut crc = crc20_symbols(&buffer[start..index], opts.crc);
        if opts.crc_error && counter == 3 {
            crc += 1;
        }
        buffer[index] = eop_with_crc(crc);
        index += 1;
        if opts.omit_eop && counter == 2 {
            index -= 1;
        }

        let bracket = opts.busy && counter == 0;
        let mut put = |word: u64, index: &mut usize| {
            if *index < len {
                buffer[*index] = word;
            }
            *index += 1;
        };
        if bracket {
            put(SOB, &mut index);
        }
        for _ in 0..opts.idle_gap {
            put(IDLE, &mut index);
        }
        if bracket {
            put(EOB, &mut index);
        }
        index.min(len)
    }
}

/// Fill `buffer` with a chunk stream using a fresh generator.
///
/// See [`FrameGenerator::synthesize`].
pub fn synthesize(buffer: &mut [u64], options: &EmuOptions) -> bool {
    FrameGenerator::new(options.clone()).synthesize(buffer)
}

/// Register write sequence loading `symbols` into the emulator RAM.
///
/// Four lines per symbol: address, data, write-enable high, write-enable low.
pub fn emu_config_lines(symbols: &[u64]) -> impl Iterator<Item = String> + '_ {
    symbols.iter().enumerate().flat_map(|(addr, word)| {
        [
            format!("FE_EMU_CONFIG_WRADDR=0x{addr:x}"),
            format!("FE_EMU_CONFIG_WRDATA=0x{word:x}"),
            "FE_EMU_CONFIG_WE=1".to_string(),
            "FE_EMU_CONFIG_WE=0".to_string(),
        ]
    })
}
