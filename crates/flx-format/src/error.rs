// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for format operations

use thiserror::Error;

/// Result type alias for format operations
pub type Result<T> = std::result::Result<T, FormatError>;

/// Errors raised while validating format parameters
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// Requested chunk size cannot hold the chunk header
    #[error("Chunk size {size} is smaller than the {min}-byte chunk header")]
    ChunkTooSmall {
        /// Requested chunk size in bytes
        size: u32,
        /// Minimum accepted size
        min: u32,
    },

    /// Payload size does not fit the 12-bit header field
    #[error("Chunk size {size} exceeds the {max}-byte maximum")]
    ChunkTooLarge {
        /// Requested chunk size in bytes
        size: u32,
        /// Maximum accepted size
        max: u32,
    },

    /// Requested chunk size is not word aligned
    #[error("Chunk size {size} is not a multiple of 4")]
    ChunkMisaligned {
        /// Requested chunk size in bytes
        size: u32,
    },

    /// Block size is not usable for the chosen trailer format
    #[error("Invalid block size {block_size}: {reason}")]
    InvalidBlockSize {
        /// Offending block size
        block_size: usize,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Block buffer shorter than the configured block size
    #[error("Block truncated: got {got} bytes, need {need}")]
    BlockTruncated {
        /// Bytes available
        got: usize,
        /// Bytes required
        need: usize,
    },
}
