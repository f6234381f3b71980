// SPDX-License-Identifier: AGPL-3.0-only

//! Hardware driver boundary.
//!
//! A [`DmaCard`] is the register-level interface a vendor driver exposes for
//! one physical card. Every call goes through the card's [`SharedCard`]
//! mutex, so only one thread issues register operations at a time.

use crate::error::Result;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// A card shared between the threads that drive it.
pub type SharedCard<C> = Arc<Mutex<C>>;

/// Wrap a card for sharing.
pub fn shared<C: DmaCard>(card: C) -> SharedCard<C> {
    Arc::new(Mutex::new(card))
}

/// Register-level operations of a DMA-capable link card.
///
/// Addresses are physical, as the card sees them.
pub trait DmaCard: Debug + Send + 'static {
    /// Current DMA lock mask of `device`. Bit `dma_id + 1` set means the
    /// channel is owned by another process.
    ///
    /// # Errors
    ///
    /// Returns error if the driver cannot be queried.
    fn lock_mask(&mut self, device: u32) -> Result<u32>;

    /// Open `device`, taking the DMA locks in `lock_mask`.
    ///
    /// # Errors
    ///
    /// Returns error if the device does not exist or cannot be locked.
    fn open(&mut self, device: u32, lock_mask: u32) -> Result<()>;

    /// Close the device and release its locks.
    ///
    /// # Errors
    ///
    /// Returns error if the driver reports a failure.
    fn close(&mut self) -> Result<()>;

    /// Reset all DMA engines.
    ///
    /// # Errors
    ///
    /// Returns error on hardware failure.
    fn dma_reset(&mut self) -> Result<()>;

    /// Soft-reset the card logic.
    ///
    /// # Errors
    ///
    /// Returns error on hardware failure.
    fn soft_reset(&mut self) -> Result<()>;

    /// Reset interrupt counters.
    ///
    /// # Errors
    ///
    /// Returns error on hardware failure.
    fn irq_reset_counters(&mut self) -> Result<()>;

    /// Enable interrupt line `irq`.
    ///
    /// # Errors
    ///
    /// Returns error on hardware failure.
    fn irq_enable(&mut self, irq: u32) -> Result<()>;

    /// Disable all interrupts.
    ///
    /// # Errors
    ///
    /// Returns error on hardware failure.
    fn irq_disable(&mut self) -> Result<()>;

    /// Start a card-to-host transfer into `[phys, phys + size)`.
    ///
    /// # Errors
    ///
    /// Returns error if the transfer cannot be started.
    fn dma_to_host(&mut self, dma_id: u32, phys: u64, size: usize, wraparound: bool) -> Result<()>;

    /// Stop the transfer on `dma_id`.
    ///
    /// # Errors
    ///
    /// Returns error on hardware failure.
    fn dma_stop(&mut self, dma_id: u32) -> Result<()>;

    /// Hardware write pointer of `dma_id`.
    fn current_address(&self, dma_id: u32) -> u64;

    /// Allow the card to reuse memory up to `addr`.
    ///
    /// # Errors
    ///
    /// Returns error on hardware failure.
    fn dma_set_ptr(&mut self, dma_id: u32, addr: u64) -> Result<()>;

    /// Block until interrupt `irq` fires or `timeout` elapses.
    ///
    /// Returns `true` if the interrupt fired.
    fn irq_wait(&mut self, irq: u32, timeout: Duration) -> bool;
}
