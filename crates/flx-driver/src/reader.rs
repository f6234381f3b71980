// SPDX-License-Identifier: AGPL-3.0-only

//! DMA ring reader.
//!
//! A [`CardReader`] owns one card DMA channel and its pinned ring. Its
//! thread follows the hardware write pointer, hands every completed block
//! to the block handler in ring order, and moves the card's reclaim
//! pointer up behind it.
//!
//! ```text
//! Idle --configure--> Configured --start--> Running --stop--> Configured
//!                                             |
//!                                        (Stopping while the thread drains)
//! ```

use crate::card::{DmaCard, SharedCard};
use crate::config::ReaderConfig;
use crate::error::{FlxError, Result};
use crate::pinned::{PinnedAllocator, PinnedMemory};
use crate::ring::{BlockAddress, RingCursor, RingWatch};
use crate::stats::{ReaderCounts, ReaderStats};
use flx_format::card::{IRQ_DATA_AVAILABLE, OUT_OF_RANGE_POLL_MS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const STOP_POLL: Duration = Duration::from_millis(10);
const OUT_OF_RANGE_POLL: Duration = Duration::from_millis(OUT_OF_RANGE_POLL_MS);

/// Callback receiving every block, on the DMA thread.
pub type BlockHandler = Box<dyn FnMut(BlockAddress) + Send + 'static>;

/// Reader lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderState {
    /// Nothing opened or allocated
    Idle,
    /// Card open, ring allocated, DMA initialised
    Configured,
    /// DMA thread running
    Running,
    /// Waiting for the DMA thread to finish
    Stopping,
}

/// Everything the DMA thread needs, moved in at start and back at stop.
struct DmaEngine<C> {
    card: SharedCard<C>,
    cursor: RingCursor,
    virt_base: usize,
    dma_id: u32,
    interrupt_mode: bool,
    poll_time: Duration,
    threshold_bytes: u64,
    margin: u64,
    handler: Option<BlockHandler>,
    running: Arc<AtomicBool>,
    stats: Arc<ReaderStats>,
    watch: RingWatch,
    epoch: u64,
}

impl<C: DmaCard> DmaEngine<C> {
    fn run(mut self) -> Self {
        while self.running.load(Ordering::Acquire) {
            self.process();
        }
        self
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn read_pointer(&mut self) -> u64 {
        let addr = self.card.lock().current_address(self.dma_id);
        self.cursor.observe(addr);
        addr
    }

    /// One round: wait for a valid pointer and enough data, dispatch every
    /// block up to the write position, then reclaim behind it.
    fn process(&mut self) {
        let mut addr = self.read_pointer();
        while !self.cursor.in_span(addr) {
            ReaderStats::add(&self.stats.out_of_range_polls, 1);
            if !self.is_running() {
                return;
            }
            std::thread::sleep(OUT_OF_RANGE_POLL);
            addr = self.read_pointer();
        }

        while self.cursor.bytes_available() < self.threshold_bytes {
            if !self.is_running() {
                return;
            }
            if self.interrupt_mode {
                let irq = IRQ_DATA_AVAILABLE + self.dma_id;
                self.card.lock().irq_wait(irq, self.poll_time);
            } else {
                std::thread::sleep(self.poll_time);
            }
            let addr = self.read_pointer();
            if !self.cursor.in_span(addr) {
                return;
            }
        }

        let bs = self.cursor.block_size();
        let write_index = self.cursor.write_index();
        let mut dispatched = 0u64;
        while self.cursor.read_index() != write_index {
            let offset = self.cursor.advance();
            #[allow(clippy::cast_possible_truncation)]
            let addr = self.virt_base + offset as usize;
            // SAFETY: addr lies inside the pinned ring, which is only freed
            // after this thread has been joined and every link stopped.
            #[allow(clippy::cast_possible_truncation)]
            let block = unsafe { BlockAddress::from_raw(addr, bs as usize, self.epoch) };
            self.epoch += 1;
            if let Some(handler) = self.handler.as_mut() {
                handler(block);
            }
            dispatched += 1;
        }
        self.watch.publish(self.epoch);
        ReaderStats::add(&self.stats.blocks, dispatched);
        ReaderStats::add(&self.stats.bytes, dispatched * bs);

        let destination = self.cursor.reclaim(write_index, self.margin);
        let result = self.card.lock().dma_set_ptr(self.dma_id, destination);
        match result {
            Ok(()) => ReaderStats::add(&self.stats.reclaim_updates, 1),
            Err(e) => {
                ReaderStats::add(&self.stats.card_errors, 1);
                tracing::warn!("DMA {}: reclaim pointer update failed: {e}", self.dma_id);
            }
        }
    }
}

/// Reset the DMA engine and interrupts of an open card.
fn init_dma<C: DmaCard>(card: &mut C, config: &ReaderConfig) -> Result<()> {
    card.dma_reset()?;
    card.soft_reset()?;
    card.irq_reset_counters()?;
    if config.interrupt_mode {
        card.irq_enable(IRQ_DATA_AVAILABLE + config.dma_id)?;
    } else {
        card.irq_disable()?;
    }
    Ok(())
}

/// Reader of one card DMA channel.
pub struct CardReader<C: DmaCard, A: PinnedAllocator> {
    config: ReaderConfig,
    card: SharedCard<C>,
    allocator: A,
    state: ReaderState,
    card_open: bool,
    cursor: Option<RingCursor>,
    handler: Option<BlockHandler>,
    running: Arc<AtomicBool>,
    stats: Arc<ReaderStats>,
    watch: Option<RingWatch>,
    thread: Option<JoinHandle<DmaEngine<C>>>,
    // dropped last
    region: Option<A::Region>,
}

impl<C: DmaCard, A: PinnedAllocator> std::fmt::Debug for CardReader<C, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardReader")
            .field("id", &self.config.id())
            .field("dma_id", &self.config.dma_id)
            .field("state", &self.state)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl<C: DmaCard, A: PinnedAllocator> CardReader<C, A> {
    /// Create an idle reader.
    pub fn new(config: ReaderConfig, card: SharedCard<C>, allocator: A) -> Self {
        Self {
            config,
            card,
            allocator,
            state: ReaderState::Idle,
            card_open: false,
            cursor: None,
            handler: None,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ReaderStats::default()),
            watch: None,
            thread: None,
            region: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Settings.
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// The card.
    pub fn card(&self) -> &SharedCard<C> {
        &self.card
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<ReaderStats> {
        Arc::clone(&self.stats)
    }

    /// Drain the counters.
    pub fn info(&self) -> ReaderCounts {
        self.stats.drain()
    }

    /// Staleness check for consumers of block addresses, once configured.
    pub fn ring_watch(&self) -> Option<RingWatch> {
        self.watch.clone()
    }

    /// Set the callback receiving blocks. It runs on the DMA thread and
    /// must not block.
    ///
    /// Ignored with a warning while running.
    pub fn set_block_handler<F>(&mut self, handler: F)
    where
        F: FnMut(BlockAddress) + Send + 'static,
    {
        if self.thread.is_some() {
            tracing::warn!("{}: block handler cannot change while running", self.config.id());
            return;
        }
        self.handler = Some(Box::new(handler));
    }

    /// Open the card, allocate the ring and initialise DMA.
    ///
    /// A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::BlockSizeInconsistency`] or
    /// [`FlxError::Configuration`] for bad settings,
    /// [`FlxError::CardLocked`] if another process owns the DMA channel,
    /// [`FlxError::Allocation`] if the ring cannot be allocated (the card
    /// is closed again), or the card's error if it fails to initialise.
    pub fn configure(&mut self) -> Result<()> {
        if self.state != ReaderState::Idle {
            tracing::debug!("{}: already configured", self.config.id());
            return Ok(());
        }
        let id = self.config.id();
        self.config.validate().inspect_err(|e| {
            tracing::error!("{id}: {e}");
        })?;

        let device = self.config.device();
        let lock_bit = self.config.lock_bit();
        {
            let mut card = self.card.lock();
            let mask = card.lock_mask(device)?;
            if mask & lock_bit != 0 {
                let err = FlxError::CardLocked {
                    device,
                    dma_id: self.config.dma_id,
                    mask,
                };
                tracing::error!("{id}: {err}");
                return Err(err);
            }
            card.open(device, lock_bit).inspect_err(|e| {
                tracing::error!("{id}: {e}");
            })?;
        }
        self.card_open = true;

        let size = self.config.dma_memory_size;
        let tag = format!("flx-dma-{}-{}", self.config.card_id, self.config.logical_unit);
        let region = match self.allocator.allocate(self.config.numa_id, size, &tag) {
            Ok(r) if r.size() >= size => r,
            Ok(r) => {
                let err = FlxError::allocation(size, format!("got only {} bytes", r.size()));
                tracing::error!("{id}: {err}");
                return self.close_after(err);
            }
            Err(e) => {
                tracing::error!("{id}: {e}");
                return self.close_after(e);
            }
        };

        let cursor = RingCursor::new(
            region.phys_base(),
            size as u64,
            self.config.block_size() as u64,
        );
        self.watch = Some(RingWatch::new(cursor.total_blocks()));
        self.cursor = Some(cursor);
        self.region = Some(region);

        let stopped = self.card.lock().dma_stop(self.config.dma_id);
        if let Err(e) = stopped.and_then(|()| self.init_dma()) {
            tracing::error!("{id}: DMA setup failed: {e}");
            // close before the ring goes away
            let failed = self.close_after(e);
            self.watch = None;
            self.cursor = None;
            self.region = None;
            return failed;
        }
        self.state = ReaderState::Configured;
        tracing::info!(
            "{id}: configured DMA {} with {size:#x} bytes in {} blocks of {} B",
            self.config.dma_id,
            self.config.total_blocks(),
            self.config.block_size()
        );
        Ok(())
    }

    fn close_after<T>(&mut self, err: FlxError) -> Result<T> {
        if let Err(e) = self.card.lock().close() {
            tracing::warn!("{}: close after failure: {e}", self.config.id());
        }
        self.card_open = false;
        Err(err)
    }

    fn init_dma(&mut self) -> Result<()> {
        init_dma(&mut *self.card.lock(), &self.config)?;
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.reset();
        }
        if let Some(watch) = &self.watch {
            watch.publish(0);
        }
        Ok(())
    }

    /// Start the DMA transfer and the reader thread.
    ///
    /// Does nothing if already running.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::InvalidState`] unless configured, or the card's
    /// error if the transfer cannot be started.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            ReaderState::Running => {
                tracing::debug!("{}: already running", self.config.id());
                return Ok(());
            }
            ReaderState::Configured => {}
            state => return Err(FlxError::invalid_state(format!("cannot start from {state:?}"))),
        }
        let (Some(region), Some(cursor), Some(watch)) =
            (self.region.as_ref(), self.cursor.clone(), self.watch.clone())
        else {
            return Err(FlxError::invalid_state("ring not allocated"));
        };
        if self.handler.is_none() {
            tracing::warn!("{}: no block handler set, blocks will be skipped", self.config.id());
        }

        let dma_id = self.config.dma_id;
        self.card
            .lock()
            .dma_to_host(dma_id, region.phys_base(), region.size(), true)?;

        let bs = self.config.block_size() as u64;
        let engine = DmaEngine {
            card: Arc::clone(&self.card),
            cursor,
            virt_base: region.virt_base(),
            dma_id,
            interrupt_mode: self.config.interrupt_mode,
            poll_time: self.config.poll_time,
            threshold_bytes: self.config.block_threshold as u64 * bs,
            margin: self.config.margin_blocks as u64,
            handler: self.handler.take(),
            running: Arc::clone(&self.running),
            stats: Arc::clone(&self.stats),
            watch,
            epoch: 0,
        };

        self.running.store(true, Ordering::Release);
        let name = format!("flx-dma-{}-{}", self.config.card_id, self.config.logical_unit);
        match std::thread::Builder::new().name(name).spawn(move || engine.run()) {
            Ok(handle) => self.thread = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                if let Err(stop) = self.card.lock().dma_stop(dma_id) {
                    tracing::warn!("{}: DMA stop after spawn failure: {stop}", self.config.id());
                }
                return Err(e.into());
            }
        }
        self.state = ReaderState::Running;
        tracing::info!("{}: DMA {dma_id} running", self.config.id());
        Ok(())
    }

    /// Stop the reader thread, then stop and re-initialise DMA.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::Timeout`] if the thread does not finish within
    /// the stop timeout (the reader stays running and stop may be retried),
    /// or the card's error.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        self.state = ReaderState::Stopping;
        self.running.store(false, Ordering::Release);

        let deadline = Instant::now() + self.config.stop_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::error!("{}: DMA thread did not stop", self.config.id());
                self.thread = Some(handle);
                self.state = ReaderState::Running;
                return Err(FlxError::timeout(self.config.stop_timeout));
            }
            std::thread::sleep(STOP_POLL);
        }
        match handle.join() {
            Ok(engine) => {
                self.handler = engine.handler;
                self.cursor = Some(engine.cursor);
            }
            Err(_) => tracing::error!("{}: DMA thread panicked", self.config.id()),
        }

        self.card.lock().dma_stop(self.config.dma_id)?;
        self.init_dma()?;
        self.state = ReaderState::Configured;
        tracing::info!("{}: DMA {} stopped", self.config.id(), self.config.dma_id);
        Ok(())
    }
}

impl<C: DmaCard, A: PinnedAllocator> Drop for CardReader<C, A> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!("{}: stop on drop: {e}", self.config.id());
        }
        if self.thread.is_some() {
            // the thread still reads the ring
            if let Some(region) = self.region.take() {
                tracing::error!("{}: leaking DMA ring {region:?}", self.config.id());
                std::mem::forget(region);
            }
            return;
        }
        if self.card_open {
            let mut card = self.card.lock();
            if let Err(e) = card.dma_stop(self.config.dma_id) {
                tracing::warn!("{}: DMA stop on drop: {e}", self.config.id());
            }
            if let Err(e) = card.close() {
                tracing::warn!("{}: close failed: {e}", self.config.id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{EmulatedCard, EmulatorConfig};
    use crate::card::shared;
    use crate::pinned::{HostPinnedAllocator, HostRegion};
    use parking_lot::Mutex;

    fn config() -> ReaderConfig {
        ReaderConfig {
            dma_memory_size: 32 * 1024,
            block_threshold: 1,
            poll_time: Duration::from_micros(200),
            links_enabled: vec![0, 1],
            ..ReaderConfig::default()
        }
    }

    fn card(budget: u64) -> SharedCard<EmulatedCard> {
        shared(EmulatedCard::new(EmulatorConfig {
            elinks: vec![0, 64],
            block_budget: Some(budget),
            ..EmulatorConfig::default()
        }))
    }

    #[derive(Debug, Default)]
    struct NoMemory;

    impl PinnedAllocator for NoMemory {
        type Region = HostRegion;

        fn allocate(&mut self, _numa_id: u32, size: usize, _tag: &str) -> Result<HostRegion> {
            Err(FlxError::allocation(size, "test"))
        }
    }

    /// Emulated card whose next `failing_resets` DMA resets fail.
    #[derive(Debug)]
    struct FlakyReset {
        inner: EmulatedCard,
        failing_resets: u32,
    }

    impl DmaCard for FlakyReset {
        fn lock_mask(&mut self, device: u32) -> Result<u32> {
            self.inner.lock_mask(device)
        }
        fn open(&mut self, device: u32, lock_mask: u32) -> Result<()> {
            self.inner.open(device, lock_mask)
        }
        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
        fn dma_reset(&mut self) -> Result<()> {
            if self.failing_resets > 0 {
                self.failing_resets -= 1;
                return Err(FlxError::hardware("DMA reset timed out"));
            }
            self.inner.dma_reset()
        }
        fn soft_reset(&mut self) -> Result<()> {
            self.inner.soft_reset()
        }
        fn irq_reset_counters(&mut self) -> Result<()> {
            self.inner.irq_reset_counters()
        }
        fn irq_enable(&mut self, irq: u32) -> Result<()> {
            self.inner.irq_enable(irq)
        }
        fn irq_disable(&mut self) -> Result<()> {
            self.inner.irq_disable()
        }
        fn dma_to_host(&mut self, dma_id: u32, phys: u64, size: usize, wraparound: bool) -> Result<()> {
            self.inner.dma_to_host(dma_id, phys, size, wraparound)
        }
        fn dma_stop(&mut self, dma_id: u32) -> Result<()> {
            self.inner.dma_stop(dma_id)
        }
        fn current_address(&self, dma_id: u32) -> u64 {
            self.inner.current_address(dma_id)
        }
        fn dma_set_ptr(&mut self, dma_id: u32, addr: u64) -> Result<()> {
            self.inner.dma_set_ptr(dma_id, addr)
        }
        fn irq_wait(&mut self, irq: u32, timeout: Duration) -> bool {
            self.inner.irq_wait(irq, timeout)
        }
    }

    type TestReader = CardReader<EmulatedCard, HostPinnedAllocator>;

    fn collect(reader: &mut TestReader) -> Arc<Mutex<Vec<(u64, u16)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reader.set_block_handler(move |b: BlockAddress| {
            let elink = b.header().map_or(u16::MAX, |h| h.elink);
            sink.lock().push((b.epoch(), elink));
        });
        seen
    }

    fn wait_blocks(reader: &TestReader, n: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while reader.stats().snapshot().blocks < n {
            assert!(Instant::now() < deadline, "reader stalled");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn reads_blocks_in_order_across_wraps() {
        for interrupt_mode in [false, true] {
            let cfg = ReaderConfig {
                interrupt_mode,
                ..config()
            };
            let mut reader = CardReader::new(cfg, card(200), HostPinnedAllocator::new());
            reader.configure().unwrap();
            let seen = collect(&mut reader);
            reader.start().unwrap();
            wait_blocks(&reader, 200);
            reader.stop().unwrap();
            assert_eq!(reader.state(), ReaderState::Configured);

            let seen = seen.lock();
            assert_eq!(seen.len(), 200);
            for (i, &(epoch, elink)) in seen.iter().enumerate() {
                assert_eq!(epoch, i as u64);
                assert_eq!(elink, if i % 2 == 0 { 0 } else { 64 });
            }
            let counts = reader.info();
            assert_eq!(counts.bytes, 200 * 1024);
            assert!(counts.reclaim_updates > 0);
            assert_eq!(counts.card_errors, 0);
        }
    }

    #[test]
    fn lifecycle_rules() {
        let mut reader = CardReader::new(config(), card(4), HostPinnedAllocator::new());
        assert!(matches!(reader.start(), Err(FlxError::InvalidState { .. })));
        reader.configure().unwrap();
        reader.configure().unwrap();
        reader.start().unwrap();
        reader.start().unwrap();
        assert_eq!(reader.state(), ReaderState::Running);
        reader.stop().unwrap();
        reader.stop().unwrap();
        // restart after stop
        reader.start().unwrap();
        reader.stop().unwrap();
    }

    #[test]
    fn locked_channel_refused() {
        let card = shared(EmulatedCard::new(EmulatorConfig {
            foreign_lock_mask: 0b10,
            ..EmulatorConfig::default()
        }));
        let mut reader = CardReader::new(config(), card, HostPinnedAllocator::new());
        assert!(matches!(
            reader.configure(),
            Err(FlxError::CardLocked { device: 0, dma_id: 0, mask: 0b10 })
        ));
        assert_eq!(reader.state(), ReaderState::Idle);
    }

    #[test]
    fn allocation_failure_closes_card() {
        let card = card(1);
        let mut reader = CardReader::new(config(), Arc::clone(&card), NoMemory);
        assert!(matches!(reader.configure(), Err(FlxError::Allocation { .. })));
        assert_eq!(card.lock().device(), None);
        assert_eq!(reader.state(), ReaderState::Idle);
    }

    #[test]
    fn bad_block_size_is_fatal_before_open() {
        let card = card(1);
        let cfg = ReaderConfig {
            block_size_kb: 2,
            ..config()
        };
        let mut reader = CardReader::new(cfg, Arc::clone(&card), HostPinnedAllocator::new());
        let err = reader.configure().unwrap_err();
        assert!(matches!(err, FlxError::BlockSizeInconsistency { .. }));
        assert!(err.is_fatal());
        assert_eq!(card.lock().device(), None);
    }

    #[test]
    fn failed_dma_setup_releases_card_for_retry() {
        let card = shared(FlakyReset {
            inner: EmulatedCard::new(EmulatorConfig {
                elinks: vec![0, 64],
                block_budget: Some(4),
                ..EmulatorConfig::default()
            }),
            failing_resets: 1,
        });
        let mut reader = CardReader::new(config(), Arc::clone(&card), HostPinnedAllocator::new());
        assert!(matches!(reader.configure(), Err(FlxError::Hardware { .. })));
        assert_eq!(reader.state(), ReaderState::Idle);
        assert_eq!(card.lock().inner.device(), None);
        assert_eq!(card.lock().inner.lock_mask(0).unwrap(), 0);

        reader.configure().unwrap();
        assert_eq!(reader.state(), ReaderState::Configured);
        assert_eq!(card.lock().inner.device(), Some(0));
        reader.start().unwrap();
        reader.stop().unwrap();
    }
}
