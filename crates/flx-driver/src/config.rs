// SPDX-License-Identifier: AGPL-3.0-only

//! Reader configuration.

use crate::error::{FlxError, Result};
use crate::parser::{CrcErrorPolicy, ParserConfig};
use flx_format::block::TrailerFormat;
use flx_format::card::{
    elink_tag, BLOCK_QUEUE_CAPACITY, BLOCK_SIZE_1K, BLOCK_THRESHOLD, DEFAULT_DMA_MEMORY_SIZE,
    DEFAULT_POLL_TIME_US, MARGIN_BLOCKS, MAX_LINKS_PER_CARD, MAX_LINK_ID, TRAILER_16B,
};
use std::time::Duration;

/// Settings for one card reader and its links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Card index
    pub card_id: u32,
    /// Logical unit (SLR) of the card
    pub logical_unit: u32,
    /// DMA channel
    pub dma_id: u32,
    /// NUMA node for the ring allocation
    pub numa_id: u32,
    /// Link ids to read; each maps to elink tag `link_id * 64`
    pub links_enabled: Vec<u16>,
    /// Block size in KiB
    pub block_size_kb: usize,
    /// Subchunk trailer width in bits, 16 or 32
    pub chunk_trailer_bits: u32,
    /// Sleep between polls while waiting for data
    pub poll_time: Duration,
    /// Wait on the data-available interrupt instead of sleeping
    pub interrupt_mode: bool,
    /// Blocks kept between the reclaim pointer and the write position
    pub margin_blocks: usize,
    /// Blocks that must be available before a dispatch round
    pub block_threshold: usize,
    /// Ring size in bytes
    pub dma_memory_size: usize,
    /// Per-link block queue capacity
    pub queue_capacity: usize,
    /// Handling of CRC-flagged subchunks
    pub crc_policy: CrcErrorPolicy,
    /// Link worker sleep when its queue is empty
    pub idle_sleep: Duration,
    /// Longest wait for a worker thread at stop
    pub stop_timeout: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            card_id: 0,
            logical_unit: 0,
            dma_id: 0,
            numa_id: 0,
            links_enabled: Vec::new(),
            block_size_kb: 1,
            chunk_trailer_bits: TRAILER_16B,
            poll_time: Duration::from_micros(DEFAULT_POLL_TIME_US),
            interrupt_mode: false,
            margin_blocks: MARGIN_BLOCKS,
            block_threshold: BLOCK_THRESHOLD,
            dma_memory_size: DEFAULT_DMA_MEMORY_SIZE,
            queue_capacity: BLOCK_QUEUE_CAPACITY,
            crc_policy: CrcErrorPolicy::default(),
            idle_sleep: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl ReaderConfig {
    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size_kb * BLOCK_SIZE_1K
    }

    /// Trailer format selected by `chunk_trailer_bits`.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::BlockSizeInconsistency`] for widths other than
    /// 16 or 32.
    pub fn trailer_format(&self) -> Result<TrailerFormat> {
        TrailerFormat::from_bits(self.chunk_trailer_bits).ok_or_else(|| {
            FlxError::BlockSizeInconsistency {
                block_size: self.block_size(),
                trailer_bits: self.chunk_trailer_bits,
                reason: "trailer must be 16 or 32 bits".into(),
            }
        })
    }

    /// Parser settings for the links.
    ///
    /// # Errors
    ///
    /// See [`ReaderConfig::trailer_format`].
    pub fn parser_config(&self) -> Result<ParserConfig> {
        Ok(ParserConfig {
            block_size: self.block_size(),
            trailer: self.trailer_format()?,
            crc_policy: self.crc_policy,
        })
    }

    /// Elink tags of the enabled links, in configuration order.
    ///
    /// Link ids above [`MAX_LINK_ID`] have no tag and are left out;
    /// [`ReaderConfig::validate`] rejects them.
    pub fn tags(&self) -> Vec<u16> {
        self.links_enabled.iter().filter_map(|&l| elink_tag(l)).collect()
    }

    /// Ring size in blocks.
    pub fn total_blocks(&self) -> usize {
        match self.block_size() {
            0 => 0,
            bs => self.dma_memory_size / bs,
        }
    }

    /// Absolute device number.
    pub fn device(&self) -> u32 {
        self.card_id + self.logical_unit
    }

    /// Lock mask bit of the DMA channel.
    pub fn lock_bit(&self) -> u32 {
        1 << (self.dma_id + 1)
    }

    /// Short identifier used in log lines.
    pub fn id(&self) -> String {
        format!("[id:{} slr:{}]", self.card_id, self.logical_unit)
    }

    /// Check the settings before anything is opened or allocated.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::BlockSizeInconsistency`] for an unusable block
    /// size and trailer combination, [`FlxError::Configuration`] for any
    /// other bad value.
    pub fn validate(&self) -> Result<()> {
        let trailer = self.trailer_format()?;
        trailer
            .check_block_size(self.block_size())
            .map_err(|e| FlxError::BlockSizeInconsistency {
                block_size: self.block_size(),
                trailer_bits: self.chunk_trailer_bits,
                reason: e.to_string(),
            })?;

        if self.dma_id >= 31 {
            return Err(FlxError::configuration(format!(
                "DMA id {} out of range",
                self.dma_id
            )));
        }
        if !self.dma_memory_size.is_power_of_two() {
            return Err(FlxError::configuration(format!(
                "DMA memory size {:#x} is not a power of two",
                self.dma_memory_size
            )));
        }
        if self.dma_memory_size % self.block_size() != 0 {
            return Err(FlxError::configuration(format!(
                "DMA memory size {:#x} is not a multiple of the block size",
                self.dma_memory_size
            )));
        }
        if self.total_blocks() <= self.margin_blocks {
            return Err(FlxError::configuration(format!(
                "ring of {} blocks cannot keep a margin of {}",
                self.total_blocks(),
                self.margin_blocks
            )));
        }
        // the card never runs more than total - margin - 1 blocks ahead
        let max_threshold = self.total_blocks() - self.margin_blocks - 1;
        if self.block_threshold == 0 || self.block_threshold > max_threshold {
            return Err(FlxError::configuration(format!(
                "block threshold {} must be between 1 and {max_threshold}",
                self.block_threshold
            )));
        }
        if self.links_enabled.len() > MAX_LINKS_PER_CARD {
            return Err(FlxError::configuration(format!(
                "{} links enabled, at most {MAX_LINKS_PER_CARD} per card",
                self.links_enabled.len()
            )));
        }
        if let Some(bad) = self.links_enabled.iter().find(|&&l| l > MAX_LINK_ID) {
            return Err(FlxError::configuration(format!(
                "link id {bad} out of range, at most {MAX_LINK_ID}"
            )));
        }
        let mut tags = self.tags();
        tags.sort_unstable();
        if tags.windows(2).any(|w| w[0] == w[1]) {
            return Err(FlxError::configuration("duplicate link id"));
        }
        if self.queue_capacity == 0 {
            return Err(FlxError::configuration("queue capacity must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flx_format::card::TRAILER_32B;

    fn small() -> ReaderConfig {
        ReaderConfig {
            dma_memory_size: 64 * 1024,
            block_threshold: 4,
            links_enabled: vec![0, 1],
            ..ReaderConfig::default()
        }
    }

    #[test]
    fn default_matches_card_constants() {
        let c = ReaderConfig::default();
        assert_eq!(c.block_size(), 1024);
        assert_eq!(c.margin_blocks, 4);
        assert_eq!(c.block_threshold, 256);
        assert_eq!(c.poll_time, Duration::from_millis(5));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn derived_values() {
        let mut c = small();
        c.card_id = 2;
        c.logical_unit = 1;
        c.dma_id = 1;
        assert_eq!(c.tags(), [0, 64]);
        c.links_enabled = vec![31, 2];
        assert_eq!(c.tags(), [0x7C0, 128]);
        assert_eq!(c.total_blocks(), 64);
        assert_eq!(c.device(), 3);
        assert_eq!(c.lock_bit(), 0b100);
        assert_eq!(c.id(), "[id:2 slr:1]");
    }

    #[test]
    fn large_blocks_need_wide_trailers() {
        let mut c = small();
        c.block_size_kb = 4;
        assert!(matches!(
            c.validate(),
            Err(FlxError::BlockSizeInconsistency { block_size: 4096, trailer_bits: 16, .. })
        ));
        c.chunk_trailer_bits = TRAILER_32B;
        assert!(c.validate().is_ok());
        assert_eq!(
            c.parser_config().unwrap(),
            ParserConfig {
                block_size: 4096,
                trailer: TrailerFormat::Bits32,
                crc_policy: CrcErrorPolicy::DropChunk,
            }
        );
        c.chunk_trailer_bits = 24;
        assert!(matches!(c.validate(), Err(FlxError::BlockSizeInconsistency { .. })));
    }

    #[test]
    fn rejects_bad_values() {
        let cases: Vec<fn(&mut ReaderConfig)> = vec![
            |c| c.dma_memory_size = 48 * 1024,
            |c| c.margin_blocks = 64,
            |c| c.block_threshold = 0,
            |c| c.block_threshold = 60,
            |c| c.links_enabled = (0..7).collect(),
            |c| c.links_enabled = vec![3, 3],
            |c| c.links_enabled = vec![40],
            |c| c.links_enabled = vec![0, 1024],
            |c| c.links_enabled = vec![u16::MAX],
            |c| c.queue_capacity = 0,
        ];
        for f in cases {
            let mut c = small();
            f(&mut c);
            assert!(matches!(c.validate(), Err(FlxError::Configuration { .. })), "{c:?}");
        }
    }
}
