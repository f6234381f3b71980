// SPDX-License-Identifier: AGPL-3.0-only

//! DMA ring bookkeeping.
//!
//! The card appends fixed-size blocks to a circular region and reports its
//! write pointer; the host consumes blocks behind it and tells the card how
//! far it may reuse memory. [`RingCursor`] holds the arithmetic, with no
//! I/O, so the index invariants can be tested in isolation.
//!
//! ```text
//!  phys                                                phys + size
//!   |  reclaimable  |<- margin ->|  unread  |  free for the card  |
//!                   ^ reclaim    ^ write    ^ current (hardware)
//! ```

use flx_format::block::BlockHeader;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Borrowed reference to one block inside the ring.
///
/// Carries the block's virtual address and length plus its epoch: the
/// absolute number of blocks the reader had handed out before it. The
/// memory stays valid while the ring is allocated, but the card may
/// overwrite it once its write pointer laps the slot; see [`RingWatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddress {
    addr: usize,
    len: usize,
    epoch: u64,
}

impl BlockAddress {
    /// Wrap a raw block address.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads of `len` bytes for as long as any
    /// copy of the returned value is used. The ring reader upholds this by
    /// stopping every consumer before releasing the ring.
    pub const unsafe fn from_raw(addr: usize, len: usize, epoch: u64) -> Self {
        Self { addr, len, epoch }
    }

    /// Wrap a block held in a slice.
    ///
    /// # Safety
    ///
    /// `block` must outlive every copy of the returned value.
    pub unsafe fn from_slice(block: &[u8], epoch: u64) -> Self {
        Self {
            addr: block.as_ptr() as usize,
            len: block.len(),
            epoch,
        }
    }

    /// Virtual address of the block.
    pub const fn addr(&self) -> usize {
        self.addr
    }

    /// Block length in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the block is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute sequence number of the block in the ring.
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Block contents.
    pub fn bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: from_raw/from_slice require addr to be readable for len
        // bytes while this value is in use.
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    /// Decode the block header, `None` if the marker is missing.
    pub fn header(&self) -> Option<BlockHeader> {
        BlockHeader::parse(self.bytes())
    }
}

/// Staleness check shared between the ring reader and the link workers.
///
/// The reader publishes the absolute count of blocks it has observed the
/// card writing. A block whose epoch is a full ring behind that count has
/// been overwritten.
#[derive(Debug, Clone)]
pub struct RingWatch {
    write_mark: Arc<AtomicU64>,
    total_blocks: u64,
}

impl RingWatch {
    /// Watch a ring of `total_blocks` blocks.
    pub fn new(total_blocks: u64) -> Self {
        Self {
            write_mark: Arc::new(AtomicU64::new(0)),
            total_blocks,
        }
    }

    /// Record that the card has written `count` blocks in total.
    pub fn publish(&self, count: u64) {
        self.write_mark.store(count, Ordering::Release);
    }

    /// Blocks observed written so far.
    pub fn write_mark(&self) -> u64 {
        self.write_mark.load(Ordering::Acquire)
    }

    /// Ring size in blocks.
    pub const fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Whether `block` may already have been overwritten.
    pub fn is_stale(&self, block: &BlockAddress) -> bool {
        block.epoch().saturating_add(self.total_blocks) <= self.write_mark()
    }
}

/// Read/write cursors over the ring, in block units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingCursor {
    phys_base: u64,
    size: u64,
    block_size: u64,
    read_index: u64,
    current: u64,
    destination: u64,
}

impl RingCursor {
    /// Cursor over `[phys_base, phys_base + size)` split into `block_size`
    /// blocks. `size` must be a non-zero multiple of `block_size`.
    pub const fn new(phys_base: u64, size: u64, block_size: u64) -> Self {
        Self {
            phys_base,
            size,
            block_size,
            read_index: 0,
            current: phys_base,
            destination: phys_base,
        }
    }

    /// Return to the freshly initialised state.
    pub fn reset(&mut self) {
        self.current = self.phys_base;
        self.destination = self.phys_base;
        self.read_index = 0;
    }

    /// Ring size in blocks.
    pub const fn total_blocks(&self) -> u64 {
        self.size / self.block_size
    }

    /// Block size in bytes.
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Index of the next block to hand out.
    pub const fn read_index(&self) -> u64 {
        self.read_index
    }

    /// Last observed hardware write pointer.
    pub const fn current(&self) -> u64 {
        self.current
    }

    /// Last reclaim pointer computed.
    pub const fn destination(&self) -> u64 {
        self.destination
    }

    /// Record a hardware write pointer reading.
    pub fn observe(&mut self, addr: u64) {
        self.current = addr;
    }

    /// Whether `addr` lies inside the ring. The end address is accepted:
    /// the card reports it before wrapping.
    pub const fn in_span(&self, addr: u64) -> bool {
        addr >= self.phys_base && addr <= self.phys_base + self.size
    }

    /// Bytes written by the card and not yet handed out.
    pub const fn bytes_available(&self) -> u64 {
        let write_off = self.current - self.phys_base;
        let read_off = self.read_index * self.block_size;
        (write_off + self.size - read_off) % self.size
    }

    /// Whole blocks available.
    pub const fn blocks_available(&self) -> u64 {
        self.bytes_available() / self.block_size
    }

    /// Block index the card is writing next.
    ///
    /// Taken modulo the ring size so that a pointer sitting exactly on the
    /// end address maps to block 0.
    pub const fn write_index(&self) -> u64 {
        ((self.current - self.phys_base) / self.block_size) % self.total_blocks()
    }

    /// Step the read index one block forward, returning the offset in bytes
    /// of the block just passed.
    pub fn advance(&mut self) -> u64 {
        let offset = self.read_index * self.block_size;
        self.read_index = (self.read_index + 1) % self.total_blocks();
        offset
    }

    /// Pointer the card may reuse memory up to: `margin` blocks behind
    /// `write_index`, wrapped into the ring. Recorded as the destination.
    pub fn reclaim(&mut self, write_index: u64, margin: u64) -> u64 {
        let total = self.total_blocks();
        let index = (write_index + total - margin % total) % total;
        self.destination = self.phys_base + index * self.block_size;
        self.destination
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASE: u64 = 0x1_0000_0000;
    const BS: u64 = 1024;

    #[test]
    fn fresh_cursor_is_empty() {
        let c = RingCursor::new(BASE, 64 * BS, BS);
        assert_eq!(c.total_blocks(), 64);
        assert_eq!(c.bytes_available(), 0);
        assert_eq!(c.write_index(), 0);
        assert!(c.in_span(c.current()));
    }

    #[test]
    fn out_of_span_pointers() {
        let c = RingCursor::new(BASE, 64 * BS, BS);
        assert!(!c.in_span(0));
        assert!(!c.in_span(BASE - 1));
        assert!(c.in_span(BASE + 64 * BS));
        assert!(!c.in_span(BASE + 64 * BS + 1));
    }

    #[test]
    fn end_address_maps_to_block_zero() {
        let mut c = RingCursor::new(BASE, 64 * BS, BS);
        c.observe(BASE + 64 * BS);
        assert_eq!(c.write_index(), 0);
        assert_eq!(c.bytes_available(), 0);
    }

    #[test]
    fn availability_wraps() {
        let mut c = RingCursor::new(BASE, 8 * BS, BS);
        c.observe(BASE + 6 * BS);
        while c.read_index() != c.write_index() {
            c.advance();
        }
        c.observe(BASE + 2 * BS);
        assert_eq!(c.blocks_available(), 4);
        assert_eq!(c.write_index(), 2);
    }

    #[test]
    fn reclaim_wraps_below_base() {
        let mut c = RingCursor::new(BASE, 8 * BS, BS);
        assert_eq!(c.reclaim(6, 4), BASE + 2 * BS);
        assert_eq!(c.reclaim(1, 4), BASE + 5 * BS);
        assert_eq!(c.destination(), BASE + 5 * BS);
    }

    #[test]
    fn stale_after_one_lap() {
        let watch = RingWatch::new(16);
        let data = [0u8; 4];
        // SAFETY: data outlives block.
        let block = unsafe { BlockAddress::from_slice(&data, 3) };
        watch.publish(18);
        assert!(!watch.is_stale(&block));
        watch.publish(19);
        assert!(watch.is_stale(&block));
    }

    proptest! {
        /// Drive the cursor the way the consumer loop does, with a card that
        /// never passes the reclaim pointer.
        #[test]
        fn indices_never_lap(
            total in 8u64..128,
            margin in 1u64..6,
            steps in prop::collection::vec(0u64..200, 1..64),
        ) {
            prop_assume!(margin < total);
            let mut c = RingCursor::new(BASE, total * BS, BS);
            let mut written = 0u64; // absolute blocks written by the card
            let mut read = 0u64;    // absolute blocks handed out
            let mut reclaimed = 0u64; // absolute limit the card may write to

            for step in steps {
                // the card keeps one block free before the reclaim pointer
                let limit = reclaimed + total - 1;
                written = (written + step).min(limit.max(written));
                prop_assert!(written - read < total);

                let wrap = written % total;
                // report the end address instead of 0 on an exact wrap
                let addr = if wrap == 0 && written > 0 { BASE + total * BS } else { BASE + wrap * BS };
                c.observe(addr);
                prop_assert_eq!(c.blocks_available(), written - read);

                let w = c.write_index();
                while c.read_index() != w {
                    c.advance();
                    read += 1;
                }
                prop_assert_eq!(read, written);

                let dest = c.reclaim(w, margin);
                let behind = (w + total - (dest - BASE) / BS) % total;
                prop_assert_eq!(behind, margin);
                reclaimed = written.saturating_sub(margin);
            }
        }
    }
}
