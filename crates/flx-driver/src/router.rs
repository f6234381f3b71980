// SPDX-License-Identifier: AGPL-3.0-only

//! Elink fan-out.
//!
//! The router runs inside the DMA thread's block handler. It reads the
//! elink field of each block header and pushes the block address into the
//! matching pipeline's queue. It never blocks: full queues and unknown
//! elinks are counted.

use crate::error::{FlxError, Result};
use crate::link::LinkSender;
use crate::ring::BlockAddress;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maps elink tags to pipeline queues.
#[derive(Debug, Default)]
pub struct ElinkRouter {
    routes: HashMap<u16, LinkSender>,
    unexpected: Arc<AtomicU64>,
}

impl ElinkRouter {
    /// Empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route blocks tagged `tag` to `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::Configuration`] if `tag` already has a route.
    pub fn add_route(&mut self, tag: u16, sender: LinkSender) -> Result<()> {
        if self.routes.contains_key(&tag) {
            return Err(FlxError::configuration(format!(
                "elink {tag:#x} registered twice"
            )));
        }
        self.routes.insert(tag, sender);
        Ok(())
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<u16> {
        let mut tags: Vec<u16> = self.routes.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Check that one route exists per enabled link.
    ///
    /// # Errors
    ///
    /// Returns [`FlxError::ElinkInconsistency`] on a count mismatch.
    pub fn check_link_count(&self, enabled: usize) -> Result<()> {
        if self.routes.len() == enabled {
            Ok(())
        } else {
            Err(FlxError::ElinkInconsistency {
                enabled,
                registered: self.routes.len(),
            })
        }
    }

    /// Counter of blocks with no route or no valid header.
    pub fn unexpected_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.unexpected)
    }

    /// Dispatch one block. Returns `true` if it was queued.
    #[inline]
    pub fn route(&mut self, block: BlockAddress) -> bool {
        let sender = block
            .header()
            .and_then(|h| self.routes.get_mut(&h.elink));
        match sender {
            Some(sender) => sender.enqueue(block),
            None => {
                self.unexpected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::CountingHandler;
    use crate::link::{LinkIds, LinkPipeline};
    use crate::parser::CrcErrorPolicy;
    use flx_format::block::BlockHeader;
    use std::time::{Duration, Instant};

    fn block(elink: u16) -> Vec<u8> {
        let mut b = vec![0u8; 1024];
        b[..4].copy_from_slice(&BlockHeader { elink, seqnum: 0 }.encode().to_le_bytes());
        b
    }

    #[test]
    fn routes_by_elink() {
        let mut a = LinkPipeline::new(LinkIds::new(0, 0, 0).unwrap(), 4, CountingHandler::new());
        let mut b = LinkPipeline::new(LinkIds::new(0, 0, 1).unwrap(), 4, CountingHandler::new());
        let mut router = ElinkRouter::new();
        router.add_route(a.tag(), a.sender().unwrap()).unwrap();
        router.add_route(b.tag(), b.sender().unwrap()).unwrap();
        assert_eq!(router.tags(), [0, 64]);
        router.check_link_count(2).unwrap();

        let blocks = [block(0), block(64), block(64), block(5)];
        let mut junk = block(0);
        junk[3] = 0;
        for (i, data) in blocks.iter().chain(std::iter::once(&junk)).enumerate() {
            // SAFETY: blocks outlive the router.
            router.route(unsafe { BlockAddress::from_slice(data, i as u64) });
        }
        assert_eq!(router.unexpected_counter().load(Ordering::Relaxed), 2);

        for p in [&mut a, &mut b] {
            p.conf(1024, false, CrcErrorPolicy::DropChunk).unwrap();
            p.start().unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while a.stats().snapshot().blocks < 1 || b.stats().snapshot().blocks < 2 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        a.stop().unwrap();
        b.stop().unwrap();
        assert_eq!(a.info().counts.blocks, 1);
        assert_eq!(b.info().counts.blocks, 2);
    }

    #[test]
    fn duplicate_route_rejected() {
        let mut a = LinkPipeline::new(LinkIds::new(0, 0, 0).unwrap(), 4, CountingHandler::new());
        let mut b = LinkPipeline::new(LinkIds::new(0, 0, 0).unwrap(), 4, CountingHandler::new());
        let mut router = ElinkRouter::new();
        router.add_route(a.tag(), a.sender().unwrap()).unwrap();
        assert!(matches!(
            router.add_route(b.tag(), b.sender().unwrap()),
            Err(FlxError::Configuration { .. })
        ));
        assert!(matches!(
            router.check_link_count(2),
            Err(FlxError::ElinkInconsistency { enabled: 2, registered: 1 })
        ));
    }
}
