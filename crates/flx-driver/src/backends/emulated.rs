// SPDX-License-Identifier: AGPL-3.0-only

//! Software-emulated link card.
//!
//! `EmulatedCard` implements [`DmaCard`] with a "hardware" thread that
//! encodes chunks into blocks with [`BlockEncoder`] and writes them into
//! the DMA target, round-robin over the configured elinks. It behaves like
//! the card's circular DMA:
//!
//! - the write pointer advances one block at a time and wraps to the base;
//! - the card never writes into the block just before the reclaim pointer,
//!   so it stops when the host falls behind;
//! - the data-available interrupt fires after every block when enabled.
//!
//! Physical addresses are taken as host addresses, so the ring must come
//! from [`HostPinnedAllocator`](crate::pinned::HostPinnedAllocator).
//!
//! Each chunk payload starts with a little-endian `u32` counter, per elink,
//! followed by the selected fill pattern.

use crate::card::DmaCard;
use crate::error::{FlxError, Result};
use flx_format::block::{BlockEncoder, SubchunkFlags, TrailerFormat, ELINK_MASK};
use flx_format::card::BLOCK_SIZE_1K;
use flx_format::emu::Pattern;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Elink tag used for blocks no link is configured for.
pub const UNKNOWN_ELINK: u16 = ELINK_MASK;

const FULL_BACKOFF: Duration = Duration::from_micros(50);

/// What the emulated card produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorConfig {
    /// Block size in bytes
    pub block_size: usize,
    /// Subchunk trailer format
    pub trailer: TrailerFormat,
    /// Elink tags to produce blocks for
    pub elinks: Vec<u16>,
    /// Chunk payload size in bytes (at least 4)
    pub chunk_size: usize,
    /// Fill pattern after the chunk counter
    pub pattern: Pattern,
    /// Stop producing after this many blocks
    pub block_budget: Option<u64>,
    /// Every n-th block carries [`UNKNOWN_ELINK`]
    pub unknown_elink_every: Option<u64>,
    /// Every n-th chunk is flagged with a CRC error
    pub crc_error_every: Option<u64>,
    /// Pause after each block; zero runs flat out
    pub block_interval: Duration,
    /// DMA lock bits held by "other processes"
    pub foreign_lock_mask: u32,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE_1K,
            trailer: TrailerFormat::Bits16,
            elinks: vec![0],
            chunk_size: 464,
            pattern: Pattern::Incremental,
            block_budget: None,
            unknown_elink_every: None,
            crc_error_every: None,
            block_interval: Duration::ZERO,
            foreign_lock_mask: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Hardware {
    write_addr: AtomicU64,
    reclaim_addr: AtomicU64,
    running: AtomicBool,
    irq_enabled: AtomicBool,
    blocks_written: AtomicU64,
    irq_count: Mutex<u64>,
    irq_cond: Condvar,
}

impl Hardware {
    fn raise_irq(&self) {
        if self.irq_enabled.load(Ordering::Relaxed) {
            *self.irq_count.lock() += 1;
            self.irq_cond.notify_all();
        }
    }
}

/// Software card producing a synthetic block stream.
#[derive(Debug)]
pub struct EmulatedCard {
    config: EmulatorConfig,
    hw: Arc<Hardware>,
    device: Option<u32>,
    held_locks: u32,
    thread: Option<JoinHandle<()>>,
}

impl EmulatedCard {
    /// Create a closed card.
    pub fn new(config: EmulatorConfig) -> Self {
        Self {
            config,
            hw: Arc::new(Hardware::default()),
            device: None,
            held_locks: 0,
            thread: None,
        }
    }

    /// Emulator settings.
    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Blocks written since the last transfer start.
    pub fn blocks_written(&self) -> u64 {
        self.hw.blocks_written.load(Ordering::Acquire)
    }

    /// Whether the hardware thread is producing.
    pub fn is_transferring(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Device number, if open.
    pub fn device(&self) -> Option<u32> {
        self.device
    }

    fn require_open(&self) -> Result<u32> {
        self.device
            .ok_or_else(|| FlxError::hardware("emulated card is not open"))
    }

    fn halt(&mut self) {
        self.hw.running.store(false, Ordering::Release);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                tracing::error!("emulated card thread panicked");
            }
        }
    }
}

impl DmaCard for EmulatedCard {
    fn lock_mask(&mut self, _device: u32) -> Result<u32> {
        Ok(self.config.foreign_lock_mask | self.held_locks)
    }

    fn open(&mut self, device: u32, lock_mask: u32) -> Result<()> {
        if self.device.is_some() {
            return Err(FlxError::card_open(device, "already open"));
        }
        if self.config.foreign_lock_mask & lock_mask != 0 {
            return Err(FlxError::card_open(device, "DMA lock held elsewhere"));
        }
        self.device = Some(device);
        self.held_locks = lock_mask;
        tracing::debug!("emulated card {device} opened, locks {lock_mask:#x}");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.halt();
        if let Some(device) = self.device.take() {
            tracing::debug!("emulated card {device} closed");
        }
        self.held_locks = 0;
        Ok(())
    }

    fn dma_reset(&mut self) -> Result<()> {
        self.require_open()?;
        self.halt();
        Ok(())
    }

    fn soft_reset(&mut self) -> Result<()> {
        self.require_open().map(|_| ())
    }

    fn irq_reset_counters(&mut self) -> Result<()> {
        self.require_open()?;
        *self.hw.irq_count.lock() = 0;
        Ok(())
    }

    fn irq_enable(&mut self, _irq: u32) -> Result<()> {
        self.require_open()?;
        self.hw.irq_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn irq_disable(&mut self) -> Result<()> {
        self.require_open()?;
        self.hw.irq_enabled.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn dma_to_host(&mut self, dma_id: u32, phys: u64, size: usize, wraparound: bool) -> Result<()> {
        self.require_open()?;
        if self.thread.is_some() {
            return Err(FlxError::hardware(format!("DMA {dma_id} already active")));
        }
        if !wraparound {
            return Err(FlxError::hardware("only wraparound transfers are emulated"));
        }
        let bs = self.config.block_size;
        if size == 0 || size % bs != 0 || size / bs < 2 {
            return Err(FlxError::hardware(format!(
                "transfer size {size} is not a multiple of {bs} B blocks"
            )));
        }
        let encoders = Encoders::new(&self.config)?;

        self.hw.write_addr.store(phys, Ordering::Release);
        self.hw.reclaim_addr.store(phys, Ordering::Release);
        self.hw.blocks_written.store(0, Ordering::Release);
        self.hw.running.store(true, Ordering::Release);

        let ring = TargetRing {
            phys,
            block_size: bs as u64,
            total: (size / bs) as u64,
        };
        let hw = Arc::clone(&self.hw);
        let config = self.config.clone();
        let thread = std::thread::Builder::new()
            .name(format!("flx-emu-dma{dma_id}"))
            .spawn(move || produce(&hw, &config, ring, encoders))?;
        self.thread = Some(thread);
        tracing::debug!("emulated DMA {dma_id} started at {phys:#x}, {size:#x} bytes");
        Ok(())
    }

    fn dma_stop(&mut self, _dma_id: u32) -> Result<()> {
        self.halt();
        Ok(())
    }

    fn current_address(&self, _dma_id: u32) -> u64 {
        self.hw.write_addr.load(Ordering::Acquire)
    }

    fn dma_set_ptr(&mut self, _dma_id: u32, addr: u64) -> Result<()> {
        self.require_open()?;
        self.hw.reclaim_addr.store(addr, Ordering::Release);
        Ok(())
    }

    fn irq_wait(&mut self, _irq: u32, timeout: Duration) -> bool {
        let mut count = self.hw.irq_count.lock();
        let seen = *count;
        let result = self.hw.irq_cond.wait_for(&mut count, timeout);
        !result.timed_out() && *count != seen
    }
}

impl Drop for EmulatedCard {
    fn drop(&mut self) {
        self.halt();
    }
}

#[derive(Debug, Clone, Copy)]
struct TargetRing {
    phys: u64,
    block_size: u64,
    total: u64,
}

impl TargetRing {
    fn index(&self, addr: u64) -> u64 {
        (addr.saturating_sub(self.phys) / self.block_size) % self.total
    }
}

struct Encoders {
    links: Vec<(BlockEncoder, u32)>,
    unknown: BlockEncoder,
    next_link: usize,
    chunks: u64,
}

impl Encoders {
    fn new(config: &EmulatorConfig) -> Result<Self> {
        if config.chunk_size < 4 {
            return Err(FlxError::configuration("emulated chunk size below 4 bytes"));
        }
        let links = config
            .elinks
            .iter()
            .map(|&tag| Ok((BlockEncoder::new(tag, config.block_size, config.trailer)?, 0)))
            .collect::<Result<Vec<_>>>()?;
        let unknown = BlockEncoder::new(UNKNOWN_ELINK, config.block_size, config.trailer)?;
        Ok(Self {
            links,
            unknown,
            next_link: 0,
            chunks: 0,
        })
    }

    fn payload(config: &EmulatorConfig, counter: u32) -> Vec<u8> {
        let mut p = Vec::with_capacity(config.chunk_size);
        p.extend_from_slice(&counter.to_le_bytes());
        let mut word = 1u32;
        while p.len() < config.chunk_size {
            let bytes = config.pattern.word(word).to_le_bytes();
            let take = (config.chunk_size - p.len()).min(4);
            p.extend_from_slice(&bytes[..take]);
            word += 1;
        }
        p
    }

    fn next_block(&mut self, config: &EmulatorConfig, serial: u64) -> Vec<u8> {
        let inject = config
            .unknown_elink_every
            .is_some_and(|n| n > 0 && (serial + 1) % n == 0);
        if inject || self.links.is_empty() {
            let enc = &mut self.unknown;
            enc.push_chunk(&Self::payload(config, 0));
            enc.flush();
            return enc.pop_block().unwrap_or_default();
        }

        let i = self.next_link;
        self.next_link = (i + 1) % self.links.len();
        loop {
            let (enc, counter) = &mut self.links[i];
            if let Some(block) = enc.pop_block() {
                return block;
            }
            self.chunks += 1;
            let flags = SubchunkFlags {
                crc_error: config
                    .crc_error_every
                    .is_some_and(|n| n > 0 && self.chunks % n == 0),
                ..SubchunkFlags::default()
            };
            enc.push_chunk_flagged(&Self::payload(config, *counter), flags);
            *counter = counter.wrapping_add(1);
        }
    }
}

fn produce(hw: &Hardware, config: &EmulatorConfig, ring: TargetRing, mut encoders: Encoders) {
    let mut serial = 0u64;
    while hw.running.load(Ordering::Acquire) {
        if config.block_budget.is_some_and(|b| serial >= b) {
            break;
        }
        let write = ring.index(hw.write_addr.load(Ordering::Relaxed));
        let reclaim = ring.index(hw.reclaim_addr.load(Ordering::Acquire));
        let free = (reclaim + ring.total - write - 1) % ring.total;
        if free == 0 {
            std::thread::sleep(FULL_BACKOFF);
            continue;
        }

        let block = encoders.next_block(config, serial);
        let dst = ring.phys + write * ring.block_size;
        // SAFETY: the transfer target is a live host region of total blocks
        // (identity mapped); the reader stops this transfer before freeing it.
        unsafe {
            std::ptr::copy_nonoverlapping(block.as_ptr(), dst as *mut u8, block.len());
        }
        let next = ring.phys + ((write + 1) % ring.total) * ring.block_size;
        hw.write_addr.store(next, Ordering::Release);
        hw.blocks_written.fetch_add(1, Ordering::Release);
        hw.raise_irq();
        serial += 1;

        if !config.block_interval.is_zero() {
            std::thread::sleep(config.block_interval);
        }
    }
    tracing::debug!("emulated DMA stopped after {serial} blocks");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pinned::{HostPinnedAllocator, PinnedAllocator, PinnedMemory};
    use flx_format::block::BlockHeader;
    use std::time::Instant;

    fn wait_for(card: &EmulatedCard, blocks: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while card.blocks_written() < blocks {
            assert!(Instant::now() < deadline, "card stalled");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn payload_layout() {
        let config = EmulatorConfig {
            chunk_size: 10,
            pattern: Pattern::AllOnes,
            ..EmulatorConfig::default()
        };
        let p = Encoders::payload(&config, 7);
        assert_eq!(p, [7, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn stops_before_reclaim_pointer() {
        let mut alloc = HostPinnedAllocator::new();
        let region = alloc.allocate(0, 8 * 1024, "emu-test").unwrap();
        let mut card = EmulatedCard::new(EmulatorConfig {
            elinks: vec![0, 64],
            ..EmulatorConfig::default()
        });
        card.open(0, 0b10).unwrap();
        card.dma_to_host(0, region.phys_base(), region.size(), true).unwrap();
        wait_for(&card, 7);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(card.blocks_written(), 7);
        assert_eq!(card.current_address(0), region.phys_base() + 7 * 1024);

        // SAFETY: region is alive and the card only writes blocks 0..7.
        let bytes =
            unsafe { std::slice::from_raw_parts(region.virt_base() as *const u8, region.size()) };
        let elinks: Vec<u16> = (0..7)
            .map(|i| BlockHeader::parse(&bytes[i * 1024..]).unwrap().elink)
            .collect();
        assert_eq!(elinks, [0, 64, 0, 64, 0, 64, 0]);

        card.dma_set_ptr(0, region.phys_base() + 4 * 1024).unwrap();
        wait_for(&card, 11);
        card.dma_stop(0).unwrap();
        assert_eq!(card.current_address(0), region.phys_base() + 3 * 1024);
        card.close().unwrap();
    }

    #[test]
    fn budget_and_interrupts() {
        let mut alloc = HostPinnedAllocator::new();
        let region = alloc.allocate(0, 64 * 1024, "emu-test").unwrap();
        let mut card = EmulatedCard::new(EmulatorConfig {
            block_budget: Some(3),
            block_interval: Duration::from_millis(20),
            ..EmulatorConfig::default()
        });
        card.open(0, 0b10).unwrap();
        card.irq_reset_counters().unwrap();
        card.irq_enable(0).unwrap();
        card.dma_to_host(0, region.phys_base(), region.size(), true).unwrap();
        assert!(card.irq_wait(0, Duration::from_secs(2)));
        wait_for(&card, 3);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!card.is_transferring());
        assert_eq!(card.blocks_written(), 3);
        assert!(!card.irq_wait(0, Duration::from_millis(10)));
    }

    #[test]
    fn foreign_lock_refuses_open() {
        let mut card = EmulatedCard::new(EmulatorConfig {
            foreign_lock_mask: 0b10,
            ..EmulatorConfig::default()
        });
        assert_eq!(card.lock_mask(0).unwrap(), 0b10);
        assert!(matches!(card.open(0, 0b10), Err(FlxError::CardOpen { .. })));
        card.open(0, 0b100).unwrap();
        assert_eq!(card.lock_mask(0).unwrap(), 0b110);
        assert!(card.dma_to_host(0, 0, 0, true).is_err());
    }
}
