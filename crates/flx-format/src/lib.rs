// SPDX-License-Identifier: AGPL-3.0-only

//! Format model for FELIX link cards.
//!
//! This crate has **no hardware access**. It is a pure model of the data
//! formats a FELIX card speaks: the full-mode symbol stream coming off a
//! front-end link, the CRC-20 guarding every chunk, and the DMA block format
//! the card writes into host memory.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`symbols`] | K-character control symbols (IDLE, SOP, EOP, SOB, EOB) |
//! | [`crc`] | CRC-20 with the legacy and new generator polynomials |
//! | [`chunk`] | Chunk header layout (fixed-tag and stream-id variants) |
//! | [`emu`] | Frame synthesis for the card's front-end emulator |
//! | [`scan`] | Symbol-stream scanner recovering chunks and checking CRCs |
//! | [`block`] | Block header, subchunk trailers, block encoder |
//! | [`card`] | Card-level constants (block size, margins, thresholds) |
//!
//! # Example
//!
//! ```
//! use flx_format::emu::{synthesize, EmuOptions};
//! use flx_format::scan::FrameScanner;
//!
//! let mut stream = vec![0u64; 1024];
//! assert!(synthesize(&mut stream, &EmuOptions::default()));
//!
//! let chunks: Vec<_> = FrameScanner::new(&stream).collect();
//! assert_eq!(chunks.len(), (1024 - 2) / (1 + 464 / 4 + 1 + 1));
//! assert!(chunks.iter().all(|c| c.as_chunk().is_some_and(|c| c.crc_ok())));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod block;
pub mod card;
pub mod chunk;
pub mod crc;
pub mod emu;
mod error;
pub mod scan;
pub mod symbols;

pub use error::{FormatError, Result};
