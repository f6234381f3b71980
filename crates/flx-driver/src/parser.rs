// SPDX-License-Identifier: AGPL-3.0-only

//! Block parser and payload callbacks.
//!
//! A [`BlockParser`] walks the subchunk trailers of each block backwards
//! from the block end, then replays the subchunks in order and reassembles
//! chunks that span subchunks and blocks. Results go to a
//! [`PayloadHandler`] through four callback pairs:
//!
//! | Category | ok | with error |
//! |----------|----|------------|
//! | chunk (multi-subchunk) | [`PayloadHandler::chunk`] | [`PayloadHandler::chunk_with_error`] |
//! | shortchunk (one subchunk) | [`PayloadHandler::shortchunk`] | [`PayloadHandler::shortchunk_with_error`] |
//! | subchunk fragment | [`PayloadHandler::subchunk`] | [`PayloadHandler::subchunk_with_error`] |
//! | block | [`PayloadHandler::block`] | [`PayloadHandler::block_with_error`] |
//!
//! Fragments of a chunk still open when a block ends are copied into
//! [`Bytes`] so the chunk survives the block being reclaimed. Shortchunk and
//! subchunk views borrow the block and are only valid inside the callback.

use crate::stats::ParserStats;
use bytes::Bytes;
use flx_format::block::{
    BlockHeader, SubchunkTrailer, SubchunkType, TrailerFormat, BLOCK_HEADER_SIZE, SEQNUM_MODULUS,
};
use std::sync::Arc;

/// What to do with data flagged by the front-end CRC check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CrcErrorPolicy {
    /// Deliver the affected chunk through the error callback, keep the rest
    #[default]
    DropChunk,
    /// Reject the whole block
    DropBlock,
}

/// Parser settings fixed at configure time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserConfig {
    /// Block size in bytes
    pub block_size: usize,
    /// Trailer width
    pub trailer: TrailerFormat,
    /// CRC error handling
    pub crc_policy: CrcErrorPolicy,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            block_size: flx_format::card::BLOCK_SIZE_1K,
            trailer: TrailerFormat::Bits16,
            crc_policy: CrcErrorPolicy::DropChunk,
        }
    }
}

// ── Views ────────────────────────────────────────────────────────────────────

/// A chunk assembled from several subchunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    /// Elink of the block that completed the chunk
    pub elink: u16,
    /// Fragments in order
    pub fragments: &'a [Bytes],
    /// Declared total length
    pub length: usize,
}

impl Chunk<'_> {
    /// Number of fragments.
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Copy the fragments into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length);
        for f in self.fragments {
            out.extend_from_slice(f);
        }
        out
    }
}

/// A chunk carried whole in one subchunk.
#[derive(Debug, Clone, Copy)]
pub struct ShortChunk<'a> {
    /// Elink of the block
    pub elink: u16,
    /// Chunk bytes
    pub data: &'a [u8],
    /// Trailer of the subchunk
    pub trailer: SubchunkTrailer,
}

/// One subchunk fragment of a multi-subchunk chunk.
#[derive(Debug, Clone, Copy)]
pub struct Subchunk<'a> {
    /// Elink of the block
    pub elink: u16,
    /// Fragment bytes
    pub data: &'a [u8],
    /// Trailer of the subchunk
    pub trailer: SubchunkTrailer,
}

/// A whole block.
#[derive(Debug, Clone, Copy)]
pub struct Block<'a> {
    /// Decoded header, `None` if the marker was wrong
    pub header: Option<BlockHeader>,
    /// Raw block bytes
    pub data: &'a [u8],
}

/// Receiver of parsed payloads.
///
/// Every method has a no-op default, so handlers implement only what they
/// consume. Callbacks run on the link's worker thread and must not block
/// for long: the ring keeps filling while they run.
#[allow(unused_variables)]
pub trait PayloadHandler: Send + 'static {
    /// A complete multi-subchunk chunk.
    fn chunk(&mut self, chunk: &Chunk<'_>) {}

    /// A multi-subchunk chunk that was flagged, cut short or interrupted.
    fn chunk_with_error(&mut self, chunk: &Chunk<'_>) {}

    /// A chunk carried in one subchunk.
    fn shortchunk(&mut self, chunk: &ShortChunk<'_>) {}

    /// A shortchunk whose trailer carries an error flag.
    fn shortchunk_with_error(&mut self, chunk: &ShortChunk<'_>) {}

    /// A fragment of a multi-subchunk chunk.
    fn subchunk(&mut self, subchunk: &Subchunk<'_>) {}

    /// A flagged fragment, or one that arrived with no chunk open.
    fn subchunk_with_error(&mut self, subchunk: &Subchunk<'_>) {}

    /// A block whose subchunks were all walked.
    fn block(&mut self, block: &Block<'_>) {}

    /// A block that was rejected.
    fn block_with_error(&mut self, block: &Block<'_>) {}
}

/// Handler that ignores everything. Counters are still kept by the parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl PayloadHandler for NullHandler {}

impl<H: PayloadHandler + ?Sized> PayloadHandler for Box<H> {
    fn chunk(&mut self, chunk: &Chunk<'_>) {
        (**self).chunk(chunk);
    }
    fn chunk_with_error(&mut self, chunk: &Chunk<'_>) {
        (**self).chunk_with_error(chunk);
    }
    fn shortchunk(&mut self, chunk: &ShortChunk<'_>) {
        (**self).shortchunk(chunk);
    }
    fn shortchunk_with_error(&mut self, chunk: &ShortChunk<'_>) {
        (**self).shortchunk_with_error(chunk);
    }
    fn subchunk(&mut self, subchunk: &Subchunk<'_>) {
        (**self).subchunk(subchunk);
    }
    fn subchunk_with_error(&mut self, subchunk: &Subchunk<'_>) {
        (**self).subchunk_with_error(subchunk);
    }
    fn block(&mut self, block: &Block<'_>) {
        (**self).block(block);
    }
    fn block_with_error(&mut self, block: &Block<'_>) {
        (**self).block_with_error(block);
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PendingChunk {
    fragments: Vec<Bytes>,
    length: usize,
    flagged: bool,
}

/// Block parser bound to one handler.
#[derive(Debug)]
pub struct BlockParser<H> {
    config: ParserConfig,
    handler: H,
    stats: Arc<ParserStats>,
    pending: Option<PendingChunk>,
    next_seqnum: Option<u8>,
    spans: Vec<(usize, SubchunkTrailer)>,
}

impl<H: PayloadHandler> BlockParser<H> {
    /// Create a parser feeding `handler` and counting into `stats`.
    pub fn new(config: ParserConfig, handler: H, stats: Arc<ParserStats>) -> Self {
        let max_subchunks = config.block_size / config.trailer.size();
        Self {
            config,
            handler,
            stats,
            pending: None,
            next_seqnum: None,
            spans: Vec::with_capacity(max_subchunks.min(1024)),
        }
    }

    /// Replace the settings. Any partly received chunk is dropped.
    pub fn configure(&mut self, config: ParserConfig) {
        self.config = config;
        self.reset();
    }

    /// Settings in use.
    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Forget any partly received chunk and the expected sequence number.
    pub fn reset(&mut self) {
        self.pending = None;
        self.next_seqnum = None;
    }

    /// The handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The handler, mutably.
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<ParserStats> {
        &self.stats
    }

    /// Consume the parser, returning the handler.
    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Parse one block.
    pub fn process(&mut self, data: &[u8]) {
        let header = BlockHeader::parse(data);
        let Some(hdr) = header else {
            self.reject(data, None);
            return;
        };
        if data.len() != self.config.block_size {
            self.reject(data, header);
            return;
        }

        if let Some(expected) = self.next_seqnum {
            if hdr.seqnum != expected {
                ParserStats::bump(&self.stats.seqnum_errors);
                // the middle of an open chunk went missing
                self.abandon_pending(hdr.elink);
            }
        }
        self.next_seqnum = Some((hdr.seqnum + 1) % SEQNUM_MODULUS);

        if !self.walk_trailers(data) {
            self.reject(data, header);
            return;
        }

        if self.config.crc_policy == CrcErrorPolicy::DropBlock
            && self.spans.iter().any(|(_, t)| t.flags.crc_error)
        {
            ParserStats::bump(&self.stats.subchunk_crc_errors);
            self.pending = None;
            self.reject(data, header);
            return;
        }

        let spans = std::mem::take(&mut self.spans);
        for &(start, trailer) in &spans {
            let bytes = &data[start..start + trailer.length];
            self.subchunk_in(hdr.elink, bytes, trailer);
        }
        self.spans = spans;

        self.handler.block(&Block { header, data });
        ParserStats::bump(&self.stats.blocks);
    }

    /// Fill `self.spans` with (data offset, trailer) in block order.
    /// Returns `false` if the trailers do not tile the block body.
    fn walk_trailers(&mut self, data: &[u8]) -> bool {
        let format = self.config.trailer;
        let tw = format.size();
        self.spans.clear();
        let mut end = data.len();
        while end > BLOCK_HEADER_SIZE {
            let Some(trailer) = SubchunkTrailer::read(format, data, end) else {
                return false;
            };
            let span = tw + format.padded(trailer.length);
            if trailer.kind().is_none() || span > end - BLOCK_HEADER_SIZE {
                return false;
            }
            end -= span;
            self.spans.push((end, trailer));
        }
        self.spans.reverse();
        true
    }

    fn subchunk_in(&mut self, elink: u16, data: &[u8], trailer: SubchunkTrailer) {
        let flags = trailer.flags;
        if flags.crc_error {
            ParserStats::bump(&self.stats.subchunk_crc_errors);
        }
        if flags.truncation {
            ParserStats::bump(&self.stats.subchunk_trunc_errors);
        }
        if flags.error {
            ParserStats::bump(&self.stats.subchunk_errors);
        }

        let Some(kind) = trailer.kind() else {
            return;
        };
        let sub = Subchunk {
            elink,
            data,
            trailer,
        };
        match kind {
            SubchunkType::Null => {}
            SubchunkType::OutOfBand => ParserStats::bump(&self.stats.out_of_band),
            SubchunkType::Both => {
                self.abandon_pending(elink);
                let short = ShortChunk {
                    elink,
                    data,
                    trailer,
                };
                if flags.any_error() {
                    self.handler.shortchunk_with_error(&short);
                    ParserStats::bump(&self.stats.error_short_chunks);
                } else {
                    self.handler.shortchunk(&short);
                    ParserStats::bump(&self.stats.short_chunks);
                }
            }
            SubchunkType::First => {
                self.abandon_pending(elink);
                self.pending = Some(PendingChunk::default());
                self.fragment(&sub);
            }
            SubchunkType::Middle => {
                if self.pending.is_some() {
                    self.fragment(&sub);
                } else {
                    self.orphan(&sub);
                }
            }
            SubchunkType::Last => {
                if self.pending.is_some() {
                    self.fragment(&sub);
                    self.finish(elink, false);
                } else {
                    self.orphan(&sub);
                }
            }
            SubchunkType::Timeout => {
                if self.pending.is_some() {
                    self.fragment(&sub);
                    self.finish(elink, true);
                } else {
                    let short = ShortChunk {
                        elink,
                        data,
                        trailer,
                    };
                    self.handler.shortchunk_with_error(&short);
                    ParserStats::bump(&self.stats.error_short_chunks);
                }
            }
        }
    }

    /// Append a fragment to the open chunk and report it.
    fn fragment(&mut self, sub: &Subchunk<'_>) {
        if let Some(pending) = self.pending.as_mut() {
            pending.fragments.push(Bytes::copy_from_slice(sub.data));
            pending.length += sub.data.len();
            pending.flagged |= sub.trailer.flags.any_error();
        }
        if sub.trailer.flags.any_error() {
            self.handler.subchunk_with_error(sub);
            ParserStats::bump(&self.stats.error_subchunks);
        } else {
            self.handler.subchunk(sub);
            ParserStats::bump(&self.stats.subchunks);
        }
    }

    fn orphan(&mut self, sub: &Subchunk<'_>) {
        self.handler.subchunk_with_error(sub);
        ParserStats::bump(&self.stats.error_subchunks);
    }

    fn finish(&mut self, elink: u16, cut: bool) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let chunk = Chunk {
            elink,
            fragments: &pending.fragments,
            length: pending.length,
        };
        if cut || pending.flagged {
            self.handler.chunk_with_error(&chunk);
            ParserStats::bump(&self.stats.error_chunks);
        } else {
            self.handler.chunk(&chunk);
            ParserStats::bump(&self.stats.chunks);
            self.stats
                .last_chunk_size
                .store(pending.length as u64, std::sync::atomic::Ordering::Relaxed);
        }
    }

    /// Deliver an open chunk that will never be completed.
    fn abandon_pending(&mut self, elink: u16) {
        if self.pending.is_some() {
            self.finish(elink, true);
        }
    }

    fn reject(&mut self, data: &[u8], header: Option<BlockHeader>) {
        self.handler.block_with_error(&Block { header, data });
        ParserStats::bump(&self.stats.error_blocks);
    }
}
