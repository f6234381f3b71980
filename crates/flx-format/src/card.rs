// SPDX-License-Identifier: AGPL-3.0-only

//! Card-level constants.
//!
//! These govern how the host consumes the DMA ring: block size, how far
//! behind the write pointer the reclaim pointer trails, and how much data
//! must accumulate before a consumer wakes up.

use crate::block::ELINK_MASK;

// ── Blocks ───────────────────────────────────────────────────────────────────

/// Base block size. Configured block sizes are multiples of this.
pub const BLOCK_SIZE_1K: usize = 1024;

/// Trailer width selecting 16-bit subchunk trailers.
pub const TRAILER_16B: u32 = 16;
/// Trailer width selecting 32-bit subchunk trailers.
pub const TRAILER_32B: u32 = 32;

// ── Ring consumption ─────────────────────────────────────────────────────────

/// Blocks the reclaim pointer is kept behind the last observed write position.
pub const MARGIN_BLOCKS: usize = 4;

/// Blocks that must be available before the consumer dispatches.
pub const BLOCK_THRESHOLD: usize = 256;

/// Sleep while the hardware write pointer lies outside the ring, in ms.
pub const OUT_OF_RANGE_POLL_MS: u64 = 5;

/// Default sleep between availability checks when not in interrupt mode, in µs.
pub const DEFAULT_POLL_TIME_US: u64 = 5000;

/// Default DMA ring size (4 GiB).
pub const DEFAULT_DMA_MEMORY_SIZE: usize = 4 << 30;

// ── Links ────────────────────────────────────────────────────────────────────

/// Links served by one logical unit.
pub const MAX_LINKS_PER_CARD: usize = 6;

/// Elink tag of link `n` is `n * ELINK_TAG_MULTIPLIER`.
pub const ELINK_TAG_MULTIPLIER: u16 = 64;

/// Default capacity of each per-link block queue.
pub const BLOCK_QUEUE_CAPACITY: usize = 1_000_000;

/// Interrupt line signalling data available to host.
pub const IRQ_DATA_AVAILABLE: u32 = 0;

/// Highest link id whose tag fits the 11-bit elink field of a block header.
pub const MAX_LINK_ID: u16 = ELINK_MASK / ELINK_TAG_MULTIPLIER;

/// Elink tag carried by blocks of link `link_id`.
///
/// `None` above [`MAX_LINK_ID`]: no block header can carry such a tag.
pub const fn elink_tag(link_id: u16) -> Option<u16> {
    if link_id > MAX_LINK_ID {
        return None;
    }
    Some(link_id * ELINK_TAG_MULTIPLIER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_64_apart() {
        assert_eq!(elink_tag(0), Some(0));
        assert_eq!(elink_tag(5), Some(320));
        assert_eq!(elink_tag(MAX_LINK_ID), Some(0x7C0));
    }

    #[test]
    fn tags_beyond_the_elink_field_are_refused() {
        assert_eq!(MAX_LINK_ID, 31);
        assert_eq!(elink_tag(32), None);
        assert_eq!(elink_tag(40), None);
        // would overflow u16 if multiplied
        assert_eq!(elink_tag(1024), None);
        assert_eq!(elink_tag(u16::MAX), None);
    }

    #[test]
    fn default_ring_is_whole_blocks() {
        assert_eq!(DEFAULT_DMA_MEMORY_SIZE % BLOCK_SIZE_1K, 0);
        assert!(DEFAULT_DMA_MEMORY_SIZE / BLOCK_SIZE_1K > BLOCK_THRESHOLD + MARGIN_BLOCKS);
    }
}
