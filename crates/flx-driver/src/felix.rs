// SPDX-License-Identifier: AGPL-3.0-only

//! Complete readout of one card DMA channel.
//!
//! [`FelixReader`] wires a [`CardReader`], an [`ElinkRouter`] and one
//! [`LinkPipeline`] per enabled link:
//!
//! ```text
//! card DMA -> CardReader thread -> ElinkRouter -> rtrb queue -> link worker -> handler
//! ```

use crate::card::{DmaCard, SharedCard};
use crate::config::ReaderConfig;
use crate::error::{FlxError, Result};
use crate::link::{LinkIds, LinkInfo, LinkPipeline};
use crate::parser::PayloadHandler;
use crate::pinned::PinnedAllocator;
use crate::reader::{CardReader, ReaderState};
use crate::router::ElinkRouter;
use crate::stats::ReaderCounts;
use flx_format::block::TrailerFormat;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters of a whole readout since the previous [`FelixReader::info`].
#[derive(Debug, Clone)]
pub struct FelixInfo {
    /// One entry per link, in registration order
    pub links: Vec<LinkInfo>,
    /// Blocks whose elink has no pipeline
    pub unexpected_elinks: u64,
    /// Ring reader counters
    pub reader: ReaderCounts,
}

/// Card reader plus its link pipelines.
#[derive(Debug)]
pub struct FelixReader<C: DmaCard, A: PinnedAllocator, H> {
    // dropped before the reader: link workers read the ring
    links: Vec<LinkPipeline<H>>,
    reader: CardReader<C, A>,
    unexpected: Option<Arc<AtomicU64>>,
}

impl<C: DmaCard, A: PinnedAllocator, H: PayloadHandler> FelixReader<C, A, H> {
    /// Create a reader with no links.
    pub fn new(config: ReaderConfig, card: SharedCard<C>, allocator: A) -> Self {
        Self {
            links: Vec::new(),
            reader: CardReader::new(config, card, allocator),
            unexpected: None,
        }
    }

    /// Settings.
    pub fn config(&self) -> &ReaderConfig {
        self.reader.config()
    }

    /// The ring reader.
    pub fn reader(&self) -> &CardReader<C, A> {
        &self.reader
    }

    /// Link pipelines, in registration order.
    pub fn links(&self) -> &[LinkPipeline<H>] {
        &self.links
    }

    fn is_configured(&self) -> bool {
        self.reader.state() != ReaderState::Idle
    }

    /// Register the pipeline for `link_id`, feeding `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::InvalidState`] once configured, or
    /// [`FlxError::Configuration`] if the link is already registered.
    pub fn add_link(&mut self, link_id: u16, handler: H) -> Result<()> {
        if self.is_configured() {
            return Err(FlxError::invalid_state("links are fixed once configured"));
        }
        let config = self.reader.config();
        let ids = LinkIds::new(config.card_id, config.logical_unit, link_id)?;
        if self.links.iter().any(|l| l.tag() == ids.tag) {
            return Err(FlxError::configuration(format!(
                "link {link_id} registered twice"
            )));
        }
        let link = LinkPipeline::new(ids, config.queue_capacity, handler)
            .with_timing(config.idle_sleep, config.stop_timeout);
        self.links.push(link);
        Ok(())
    }

    /// Check the link set, configure the card reader and the pipelines,
    /// and install the router as the block handler.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::ElinkInconsistency`] if the registered links do
    /// not match the enabled ones, or any error of
    /// [`CardReader::configure`].
    pub fn configure(&mut self) -> Result<()> {
        if self.is_configured() {
            tracing::debug!("{}: already configured", self.config().id());
            return Ok(());
        }
        let config = self.reader.config().clone();
        let id = config.id();

        let mut enabled = config.tags();
        enabled.sort_unstable();
        let mut registered: Vec<u16> = self.links.iter().map(LinkPipeline::tag).collect();
        registered.sort_unstable();
        if enabled != registered {
            let err = FlxError::ElinkInconsistency {
                enabled: enabled.len(),
                registered: registered.len(),
            };
            tracing::error!("{id}: {err} (enabled {enabled:?}, registered {registered:?})");
            return Err(err);
        }

        config.validate().inspect_err(|e| tracing::error!("{id}: {e}"))?;
        let parser = config.parser_config()?;
        for link in &mut self.links {
            link.conf(
                parser.block_size,
                parser.trailer == TrailerFormat::Bits32,
                parser.crc_policy,
            )?;
        }

        self.reader.configure()?;

        let mut router = ElinkRouter::new();
        for link in &mut self.links {
            let sender = link
                .sender()
                .ok_or_else(|| FlxError::invalid_state("link queue already routed"))?;
            router.add_route(link.tag(), sender)?;
            if let Some(watch) = self.reader.ring_watch() {
                link.watch_ring(watch);
            }
        }
        router.check_link_count(enabled.len())?;
        self.unexpected = Some(router.unexpected_counter());
        self.reader.set_block_handler(move |block| {
            router.route(block);
        });
        tracing::info!("{id}: {} links configured", self.links.len());
        Ok(())
    }

    /// Start the card reader, then the link workers.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::InvalidState`] before configure, or the first
    /// start error.
    pub fn start(&mut self) -> Result<()> {
        if !self.is_configured() {
            return Err(FlxError::invalid_state("not configured"));
        }
        self.reader.start()?;
        for link in &mut self.links {
            link.start()?;
        }
        Ok(())
    }

    /// Stop the card reader first, then the link workers, which discard
    /// what is still queued.
    ///
    /// # Errors
    ///
    /// Returns the first stop error; every component is still asked to stop.
    pub fn stop(&mut self) -> Result<()> {
        let mut first = self.reader.stop().err();
        for link in &mut self.links {
            if let Err(e) = link.stop() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Drain all counters.
    pub fn info(&mut self) -> FelixInfo {
        FelixInfo {
            links: self.links.iter_mut().map(LinkPipeline::info).collect(),
            unexpected_elinks: self
                .unexpected
                .as_ref()
                .map_or(0, |c| c.swap(0, Ordering::Relaxed)),
            reader: self.reader.info(),
        }
    }
}
