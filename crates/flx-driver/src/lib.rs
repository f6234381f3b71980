//! Host-side DMA readout for FELIX link cards.
//!
//! A card writes fixed-size blocks into a circular region of pinned host
//! memory. This crate follows the card's write pointer, routes every block
//! to the pipeline of the elink it belongs to, and decodes the blocks into
//! chunk payloads.
//!
//! # Data flow
//!
//! ```text
//! card DMA ──> CardReader ──> ElinkRouter ──┬─> LinkPipeline (elink 0x000) ─> PayloadHandler
//!   (ring)      (DMA thread)   (same thread) ├─> LinkPipeline (elink 0x040) ─> PayloadHandler
//!                                            └─> ...  one rtrb queue + worker thread each
//! ```
//!
//! The vendor driver and its memory allocator sit behind [`DmaCard`] and
//! [`PinnedAllocator`]. [`backends::EmulatedCard`] and
//! [`HostPinnedAllocator`] stand in for them without hardware.
//!
//! # Quick start
//!
//! ```no_run
//! use flx_driver::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let config = ReaderConfig {
//!     links_enabled: vec![0, 1],
//!     dma_memory_size: 1 << 20,
//!     ..ReaderConfig::default()
//! };
//! let card = shared(EmulatedCard::new(EmulatorConfig {
//!     elinks: config.tags(),
//!     ..EmulatorConfig::default()
//! }));
//!
//! let mut felix = FelixReader::new(config, card, HostPinnedAllocator::new());
//! felix.add_link(0, CountingHandler::new())?;
//! felix.add_link(1, CountingHandler::new())?;
//! felix.configure()?;
//! felix.start()?;
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! felix.stop()?;
//! for link in felix.info().links {
//!     println!("elink {:#x}: {} chunks", link.ids.tag, link.counts.chunks);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod assemble;
pub mod backends;
pub mod card;
pub mod config;
mod error;
pub mod felix;
pub mod link;
pub mod parser;
pub mod pinned;
pub mod reader;
pub mod ring;
pub mod router;
pub mod stats;

pub use assemble::{
    copy_wrapping, CountingHandler, FixedSizeAssembler, PayloadSink, VariableSizeAssembler,
};
pub use backends::{EmulatedCard, EmulatorConfig};
pub use card::{shared, DmaCard, SharedCard};
pub use config::ReaderConfig;
pub use error::{FlxError, Result};
pub use felix::{FelixInfo, FelixReader};
pub use link::{LinkIds, LinkInfo, LinkPipeline, LinkSender};
pub use parser::{
    Block, BlockParser, Chunk, CrcErrorPolicy, NullHandler, ParserConfig, PayloadHandler,
    ShortChunk, Subchunk,
};
pub use pinned::{HostPinnedAllocator, HostRegion, PinnedAllocator, PinnedMemory};
pub use reader::{BlockHandler, CardReader, ReaderState};
pub use ring::{BlockAddress, RingCursor, RingWatch};
pub use router::ElinkRouter;
pub use stats::{ParserCounts, ParserStats, ReaderCounts, ReaderStats};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        shared, BlockAddress, CardReader, CountingHandler, CrcErrorPolicy, DmaCard, EmulatedCard,
        EmulatorConfig, FelixReader, FlxError, HostPinnedAllocator, LinkPipeline, PayloadHandler,
        ReaderConfig, Result, VariableSizeAssembler,
    };
}
