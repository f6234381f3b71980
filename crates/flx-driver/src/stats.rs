// SPDX-License-Identifier: AGPL-3.0-only

//! Readout counters.
//!
//! Counters are plain atomics bumped on the data path. Reporting drains
//! them with `swap(0)`, so every report covers the interval since the
//! previous one. Gauges hold a last-seen value and survive a drain.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    (
        $(#[$smeta:meta])* $stats:ident,
        $(#[$cmeta:meta])* $counts:ident {
            $( $(#[$fmeta:meta])* $field:ident ),* $(,)?
        }
        $( gauges {
            $( $(#[$gmeta:meta])* $gauge:ident ),* $(,)?
        } )?
    ) => {
        $(#[$smeta])*
        #[derive(Debug, Default)]
        pub struct $stats {
            $( $(#[$fmeta])* pub $field: AtomicU64, )*
            $( $( $(#[$gmeta])* pub $gauge: AtomicU64, )* )?
        }

        $(#[$cmeta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $counts {
            $( $(#[$fmeta])* pub $field: u64, )*
            $( $( $(#[$gmeta])* pub $gauge: u64, )* )?
        }

        impl $stats {
            /// Read all counters and reset them to zero. Gauges keep their
            /// value.
            pub fn drain(&self) -> $counts {
                $counts {
                    $( $field: self.$field.swap(0, Ordering::Relaxed), )*
                    $( $( $gauge: self.$gauge.load(Ordering::Relaxed), )* )?
                }
            }

            /// Read all counters without resetting them.
            pub fn snapshot(&self) -> $counts {
                $counts {
                    $( $field: self.$field.load(Ordering::Relaxed), )*
                    $( $( $gauge: self.$gauge.load(Ordering::Relaxed), )* )?
                }
            }
        }
    };
}

counters! {
    /// Per-link parser counters.
    ParserStats,
    /// Drained values of [`ParserStats`].
    ParserCounts {
        /// Complete chunks delivered
        chunks,
        /// Shortchunks delivered
        short_chunks,
        /// Subchunks delivered
        subchunks,
        /// Blocks processed
        blocks,
        /// Chunks delivered with an error
        error_chunks,
        /// Shortchunks delivered with an error
        error_short_chunks,
        /// Malformed or flagged subchunks
        error_subchunks,
        /// Blocks rejected
        error_blocks,
        /// Subchunks with the CRC error flag
        subchunk_crc_errors,
        /// Subchunks with the truncation flag
        subchunk_trunc_errors,
        /// Subchunks with the generic error flag
        subchunk_errors,
        /// Block sequence number gaps
        seqnum_errors,
        /// Out-of-band subchunks skipped
        out_of_band,
        /// Blocks dropped because the link queue was full
        dropped_blocks,
        /// Blocks skipped because the card had lapped them
        stale_blocks,
        /// Queued blocks discarded at stop
        discarded_blocks,
    }
    gauges {
        /// Size of the last complete chunk, in bytes
        last_chunk_size,
    }
}

counters! {
    /// Ring reader counters.
    ReaderStats,
    /// Drained values of [`ReaderStats`].
    ReaderCounts {
        /// Blocks handed to the block handler
        blocks,
        /// Bytes handed to the block handler
        bytes,
        /// Reclaim pointer updates sent to the card
        reclaim_updates,
        /// Polls while the write pointer was outside the ring
        out_of_range_polls,
        /// Register operations that failed while running
        card_errors,
    }
}

impl ParserStats {
    /// Increment a counter by one.
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl ReaderStats {
    /// Increment a counter by `n`.
    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Convert a count over `seconds` into kHz.
#[allow(clippy::cast_precision_loss)]
pub fn rate_khz(count: u64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    count as f64 / seconds / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_resets() {
        let stats = ParserStats::default();
        ParserStats::bump(&stats.chunks);
        ParserStats::bump(&stats.chunks);
        ParserStats::bump(&stats.error_blocks);
        let first = stats.drain();
        assert_eq!(first.chunks, 2);
        assert_eq!(first.error_blocks, 1);
        assert_eq!(stats.drain(), ParserCounts::default());
    }

    #[test]
    fn drain_keeps_gauges() {
        let stats = ParserStats::default();
        ParserStats::bump(&stats.chunks);
        stats.last_chunk_size.store(464, Ordering::Relaxed);
        let first = stats.drain();
        assert_eq!((first.chunks, first.last_chunk_size), (1, 464));
        let second = stats.drain();
        assert_eq!((second.chunks, second.last_chunk_size), (0, 464));
    }

    #[test]
    fn snapshot_keeps_values() {
        let stats = ReaderStats::default();
        ReaderStats::add(&stats.bytes, 4096);
        assert_eq!(stats.snapshot().bytes, 4096);
        assert_eq!(stats.snapshot().bytes, 4096);
    }

    #[test]
    fn rate_in_khz() {
        assert!((rate_khz(5000, 2.0) - 2.5).abs() < 1e-9);
        assert!(rate_khz(10, 0.0).abs() < f64::EPSILON);
    }
}
