// SPDX-License-Identifier: AGPL-3.0-only

//! Per-elink processing pipeline.
//!
//! Each pipeline owns one bounded SPSC queue of [`BlockAddress`] values and
//! one worker thread. The producer half ([`LinkSender`]) lives in the
//! router on the DMA thread; the worker pops addresses in order and runs
//! them through its own [`BlockParser`].

use crate::error::{FlxError, Result};
use crate::parser::{BlockParser, CrcErrorPolicy, ParserConfig, PayloadHandler};
use crate::ring::{BlockAddress, RingWatch};
use crate::stats::{rate_khz, ParserCounts, ParserStats};
use flx_format::block::TrailerFormat;
use flx_format::card::{elink_tag, MAX_LINK_ID};
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const STOP_POLL: Duration = Duration::from_millis(10);

/// Identity of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkIds {
    /// Card index
    pub card_id: u32,
    /// Logical unit of the card
    pub logical_unit: u32,
    /// Link id
    pub link_id: u16,
    /// Elink tag carried in block headers
    pub tag: u16,
}

impl LinkIds {
    /// Ids for `link_id` on a card; the tag is derived from the link id.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::Configuration`] if the link id has no elink tag.
    pub fn new(card_id: u32, logical_unit: u32, link_id: u16) -> Result<Self> {
        let tag = elink_tag(link_id).ok_or_else(|| {
            FlxError::configuration(format!(
                "link id {link_id} out of range, at most {MAX_LINK_ID}"
            ))
        })?;
        Ok(Self {
            card_id,
            logical_unit,
            link_id,
            tag,
        })
    }
}

/// Producer half of a pipeline's queue.
#[derive(Debug)]
pub struct LinkSender {
    producer: Producer<BlockAddress>,
    stats: Arc<ParserStats>,
}

impl LinkSender {
    /// Queue a block without blocking.
    ///
    /// Returns `false` and counts a dropped block if the queue is full.
    #[inline]
    pub fn enqueue(&mut self, block: BlockAddress) -> bool {
        match self.producer.push(block) {
            Ok(()) => true,
            Err(PushError::Full(_)) => {
                ParserStats::bump(&self.stats.dropped_blocks);
                false
            }
        }
    }

    /// Free slots in the queue.
    pub fn slots(&self) -> usize {
        self.producer.slots()
    }
}

/// Counters drained by [`LinkPipeline::info`], with rates.
#[derive(Debug, Clone, Copy)]
pub struct LinkInfo {
    /// Pipeline identity
    pub ids: LinkIds,
    /// Counters since the previous call
    pub counts: ParserCounts,
    /// Time covered by `counts`
    pub elapsed: Duration,
    /// Blocks per second, in kHz
    pub block_rate_khz: f64,
    /// Chunks and shortchunks per second, in kHz
    pub chunk_rate_khz: f64,
}

#[derive(Debug)]
struct Worker<H> {
    consumer: Consumer<BlockAddress>,
    parser: BlockParser<H>,
    watch: Option<RingWatch>,
    idle_sleep: Duration,
}

impl<H: PayloadHandler> Worker<H> {
    fn run(mut self, running: &AtomicBool) -> Self {
        while running.load(Ordering::Acquire) {
            match self.consumer.pop() {
                Ok(block) => self.handle(block),
                Err(_) => std::thread::sleep(self.idle_sleep),
            }
        }
        self
    }

    fn handle(&mut self, block: BlockAddress) {
        if let Some(watch) = &self.watch {
            if watch.is_stale(&block) {
                ParserStats::bump(&self.parser.stats().stale_blocks);
                return;
            }
        }
        self.parser.process(block.bytes());
    }

    /// Throw away whatever is still queued. Returns the count.
    fn discard(&mut self) -> u64 {
        let mut n = 0;
        while self.consumer.pop().is_ok() {
            n += 1;
        }
        self.parser.reset();
        n
    }
}

/// One elink's queue, worker thread and parser.
#[derive(Debug)]
pub struct LinkPipeline<H> {
    ids: LinkIds,
    sender: Option<LinkSender>,
    worker: Option<Worker<H>>,
    thread: Option<JoinHandle<Worker<H>>>,
    running: Arc<AtomicBool>,
    stats: Arc<ParserStats>,
    configured: bool,
    stop_timeout: Duration,
    last_info: Instant,
}

impl<H: PayloadHandler> LinkPipeline<H> {
    /// Create a pipeline with a queue of `capacity` blocks.
    pub fn new(ids: LinkIds, capacity: usize, handler: H) -> Self {
        let (producer, consumer) = RingBuffer::new(capacity);
        let stats = Arc::new(ParserStats::default());
        let parser = BlockParser::new(ParserConfig::default(), handler, Arc::clone(&stats));
        Self {
            ids,
            sender: Some(LinkSender {
                producer,
                stats: Arc::clone(&stats),
            }),
            worker: Some(Worker {
                consumer,
                parser,
                watch: None,
                idle_sleep: STOP_POLL,
            }),
            thread: None,
            running: Arc::new(AtomicBool::new(false)),
            stats,
            configured: false,
            stop_timeout: Duration::from_secs(5),
            last_info: Instant::now(),
        }
    }

    /// Set the worker's sleep on an empty queue and the longest wait at stop.
    #[must_use]
    pub fn with_timing(mut self, idle_sleep: Duration, stop_timeout: Duration) -> Self {
        if let Some(w) = self.worker.as_mut() {
            w.idle_sleep = idle_sleep;
        }
        self.stop_timeout = stop_timeout;
        self
    }

    /// Pipeline identity.
    pub fn ids(&self) -> LinkIds {
        self.ids
    }

    /// Elink tag served.
    pub fn tag(&self) -> u16 {
        self.ids.tag
    }

    /// Take the producer half of the queue. Only the first call gets it.
    pub fn sender(&mut self) -> Option<LinkSender> {
        self.sender.take()
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<ParserStats> {
        Arc::clone(&self.stats)
    }

    /// Whether the worker thread is running.
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// The handler, while the worker is stopped.
    pub fn handler(&self) -> Option<&H> {
        self.worker.as_ref().map(|w| w.parser.handler())
    }

    /// The handler mutably, while the worker is stopped.
    pub fn handler_mut(&mut self) -> Option<&mut H> {
        self.worker.as_mut().map(|w| w.parser.handler_mut())
    }

    /// Set the block format. Only the first call takes effect.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::BlockSizeInconsistency`] if the block size cannot
    /// be used with the trailer width.
    pub fn conf(
        &mut self,
        block_size: usize,
        uses_32bit_trailer: bool,
        crc_policy: CrcErrorPolicy,
    ) -> Result<()> {
        if self.configured {
            tracing::warn!("elink {:#x}: already configured, ignoring", self.ids.tag);
            return Ok(());
        }
        let Some(worker) = self.worker.as_mut() else {
            return Err(FlxError::invalid_state("worker running or lost"));
        };
        let trailer = if uses_32bit_trailer {
            TrailerFormat::Bits32
        } else {
            TrailerFormat::Bits16
        };
        trailer
            .check_block_size(block_size)
            .map_err(|e| FlxError::BlockSizeInconsistency {
                block_size,
                trailer_bits: if uses_32bit_trailer { 32 } else { 16 },
                reason: e.to_string(),
            })?;
        worker.parser.configure(ParserConfig {
            block_size,
            trailer,
            crc_policy,
        });
        self.configured = true;
        tracing::debug!(
            "elink {:#x}: block size {block_size} B, {}-bit trailers, {crc_policy:?}",
            self.ids.tag,
            trailer.size() * 8
        );
        Ok(())
    }

    /// Let the worker skip blocks the card has already overwritten.
    pub fn watch_ring(&mut self, watch: RingWatch) {
        match self.worker.as_mut() {
            Some(w) => w.watch = Some(watch),
            None => tracing::warn!("elink {:#x}: cannot set ring watch while running", self.ids.tag),
        }
    }

    /// Start the worker thread. Does nothing if already running.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::InvalidState`] before [`LinkPipeline::conf`],
    /// or an I/O error if the thread cannot be spawned.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            tracing::debug!("elink {:#x}: already running", self.ids.tag);
            return Ok(());
        }
        if !self.configured {
            return Err(FlxError::invalid_state("link pipeline not configured"));
        }
        let worker = self
            .worker
            .take()
            .ok_or_else(|| FlxError::invalid_state("link worker lost"))?;

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let name = format!("flx-elink-{}-{}", self.ids.card_id, self.ids.tag);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.run(&running))?;
        self.thread = Some(handle);
        self.last_info = Instant::now();
        tracing::info!(
            "elink {:#x} (link {}) started",
            self.ids.tag,
            self.ids.link_id
        );
        Ok(())
    }

    /// Stop the worker and discard blocks still queued.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::Timeout`] if the worker does not finish in time
    /// (it is left running and may be stopped again), or
    /// [`FlxError::Hardware`] if it panicked.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);

        let deadline = Instant::now() + self.stop_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                tracing::error!("elink {:#x}: worker did not stop", self.ids.tag);
                self.thread = Some(handle);
                return Err(FlxError::timeout(self.stop_timeout));
            }
            std::thread::sleep(STOP_POLL);
        }

        let mut worker = handle
            .join()
            .map_err(|_| FlxError::hardware(format!("elink {:#x} worker panicked", self.ids.tag)))?;
        let discarded = worker.discard();
        if discarded > 0 {
            self.stats
                .discarded_blocks
                .fetch_add(discarded, Ordering::Relaxed);
            tracing::debug!("elink {:#x}: discarded {discarded} queued blocks", self.ids.tag);
        }
        self.worker = Some(worker);
        tracing::info!("elink {:#x} stopped", self.ids.tag);
        Ok(())
    }

    /// Drain the counters and compute rates since the previous call.
    pub fn info(&mut self) -> LinkInfo {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_info);
        self.last_info = now;
        let counts = self.stats.drain();
        let secs = elapsed.as_secs_f64();
        let info = LinkInfo {
            ids: self.ids,
            counts,
            elapsed,
            block_rate_khz: rate_khz(counts.blocks, secs),
            chunk_rate_khz: rate_khz(counts.chunks + counts.short_chunks, secs),
        };
        tracing::debug!(
            "elink {:#x}: {} blocks ({:.3} kHz), {} chunks ({:.3} kHz), {} dropped",
            self.ids.tag,
            counts.blocks,
            info.block_rate_khz,
            counts.chunks + counts.short_chunks,
            info.chunk_rate_khz,
            counts.dropped_blocks
        );
        info
    }
}

impl<H> Drop for LinkPipeline<H> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::CountingHandler;
    use flx_format::block::BlockEncoder;

    fn blocks(n: usize) -> Vec<Vec<u8>> {
        let mut enc = BlockEncoder::new(0, 1024, TrailerFormat::Bits16).unwrap();
        for i in 0..n {
            enc.push_chunk(&[i as u8; 100]);
            enc.flush();
        }
        std::iter::from_fn(|| enc.pop_block()).collect()
    }

    fn pipeline(capacity: usize) -> LinkPipeline<CountingHandler> {
        LinkPipeline::new(LinkIds::new(0, 0, 0).unwrap(), capacity, CountingHandler::new())
            .with_timing(Duration::from_millis(1), Duration::from_secs(5))
    }

    #[test]
    fn start_requires_conf() {
        let mut p = pipeline(4);
        assert!(matches!(p.start(), Err(FlxError::InvalidState { .. })));
        p.conf(1024, false, CrcErrorPolicy::DropChunk).unwrap();
        // second conf is ignored, even with a bad size
        p.conf(3000, false, CrcErrorPolicy::DropChunk).unwrap();
        p.start().unwrap();
        p.start().unwrap();
        assert!(p.is_running());
        p.stop().unwrap();
        assert!(!p.is_running());
    }

    #[test]
    fn conf_rejects_bad_block_size() {
        let mut p = pipeline(4);
        assert!(matches!(
            p.conf(2048, false, CrcErrorPolicy::DropChunk),
            Err(FlxError::BlockSizeInconsistency { block_size: 2048, trailer_bits: 16, .. })
        ));
    }

    #[test]
    fn link_ids_need_a_tag() {
        assert_eq!(LinkIds::new(1, 0, 3).unwrap().tag, 192);
        assert_eq!(LinkIds::new(0, 0, MAX_LINK_ID).unwrap().tag, 0x7C0);
        for id in [MAX_LINK_ID + 1, 1024, u16::MAX] {
            assert!(matches!(LinkIds::new(0, 0, id), Err(FlxError::Configuration { .. })));
        }
    }

    #[test]
    fn sender_handed_out_once() {
        let mut p = pipeline(4);
        assert!(p.sender().is_some());
        assert!(p.sender().is_none());
    }

    #[test]
    fn full_queue_drops() {
        let data = blocks(3);
        let mut p = pipeline(2);
        p.conf(1024, false, CrcErrorPolicy::DropChunk).unwrap();
        let mut tx = p.sender().unwrap();
        for (i, b) in data.iter().enumerate() {
            // SAFETY: data outlives the pipeline's use of the addresses.
            let addr = unsafe { BlockAddress::from_slice(b, i as u64) };
            assert_eq!(tx.enqueue(addr), i < 2);
        }
        assert_eq!(tx.slots(), 0);
        assert_eq!(p.info().counts.dropped_blocks, 1);
    }

    #[test]
    fn stop_discards_queued_blocks() {
        let data = blocks(2);
        let mut p = LinkPipeline::new(LinkIds::new(0, 0, 0).unwrap(), 8, CountingHandler::new())
            .with_timing(Duration::from_millis(300), Duration::from_secs(5));
        p.conf(1024, false, CrcErrorPolicy::DropChunk).unwrap();
        let mut tx = p.sender().unwrap();
        p.start().unwrap();
        // let the worker find the queue empty and go to sleep
        std::thread::sleep(Duration::from_millis(50));
        for (i, b) in data.iter().enumerate() {
            // SAFETY: data outlives the pipeline's use of the addresses.
            assert!(tx.enqueue(unsafe { BlockAddress::from_slice(b, i as u64) }));
        }
        p.stop().unwrap();
        let counts = p.info().counts;
        assert_eq!(counts.discarded_blocks, 2);
        assert_eq!(counts.blocks, 0);
        assert_eq!(tx.slots(), 8);
    }

    #[test]
    fn stale_blocks_skipped() {
        let data = blocks(2);
        let mut p = pipeline(8);
        p.conf(1024, false, CrcErrorPolicy::DropChunk).unwrap();
        let watch = RingWatch::new(4);
        watch.publish(5);
        p.watch_ring(watch);
        let mut tx = p.sender().unwrap();
        // SAFETY: data outlives the pipeline's use of the addresses.
        unsafe {
            tx.enqueue(BlockAddress::from_slice(&data[0], 0));
            tx.enqueue(BlockAddress::from_slice(&data[1], 3));
        }
        p.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while p.stats().snapshot().blocks + p.stats().snapshot().stale_blocks < 2 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        p.stop().unwrap();
        let counts = p.info().counts;
        assert_eq!(counts.stale_blocks, 1);
        assert_eq!(counts.blocks, 1);
        assert_eq!(p.handler().unwrap().payloads(), 1);
    }
}
