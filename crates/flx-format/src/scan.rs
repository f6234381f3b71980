// SPDX-License-Identifier: AGPL-3.0-only

//! Symbol-stream scanner.
//!
//! Walks a full-mode symbol stream and recovers the chunks framed by
//! SOP/EOP, recomputing each CRC-20. Framing faults are reported rather
//! than skipped silently:
//!
//! - a SOP while a chunk is open closes the open one as [`ScanItem::Truncated`]
//! - an EOP with no open chunk is an [`ScanItem::Orphan`]
//! - the stream ending inside a chunk is [`ScanItem::Truncated`]
//!
//! IDLE, SOB and EOB never contribute words. Data words outside a chunk
//! are counted as stray.

use crate::chunk::ChunkHeader;
use crate::crc::{crc20, CrcVariant};
use crate::symbols::Symbol;

/// One chunk recovered from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedChunk {
    /// All words between SOP and EOP, header included
    pub words: Vec<u32>,
    /// CRC carried by the EOP
    pub crc_expected: u32,
    /// CRC computed over `words`
    pub crc_computed: u32,
    /// A busy bracket was open while the chunk was received
    pub busy: bool,
}

impl ScannedChunk {
    /// Whether the carried CRC matches.
    pub fn crc_ok(&self) -> bool {
        self.crc_expected == self.crc_computed
    }

    /// Decoded header, if the chunk holds at least two words.
    pub fn header(&self) -> Option<ChunkHeader> {
        match self.words.as_slice() {
            [w1, w2, ..] => Some(ChunkHeader::decode(*w1, *w2)),
            _ => None,
        }
    }

    /// Payload words after the header.
    pub fn payload(&self) -> &[u32] {
        self.words.get(2..).unwrap_or_default()
    }

    /// Whether the header size field matches the words received.
    pub fn size_ok(&self) -> bool {
        self.header()
            .is_some_and(|h| h.payload_size as usize == self.payload().len() * 4)
    }
}

/// Result of scanning one framing unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    /// Complete SOP..EOP chunk
    Chunk(ScannedChunk),
    /// Chunk cut short by a new SOP or the end of the stream
    Truncated {
        /// Words received before the cut
        words: usize,
    },
    /// EOP without a preceding SOP
    Orphan {
        /// CRC the EOP carried
        crc: u32,
    },
}

impl ScanItem {
    /// The chunk, if this item is a complete one.
    pub fn as_chunk(&self) -> Option<&ScannedChunk> {
        match self {
            Self::Chunk(c) => Some(c),
            _ => None,
        }
    }
}

/// Iterator over the framing units of a symbol stream.
#[derive(Debug)]
pub struct FrameScanner<'a> {
    symbols: std::slice::Iter<'a, u64>,
    crc: CrcVariant,
    open: Option<Vec<u32>>,
    busy: bool,
    chunk_busy: bool,
    stray_words: usize,
    unknown_kchars: usize,
}

impl<'a> FrameScanner<'a> {
    /// Scan `symbols` using the current CRC polynomial.
    pub fn new(symbols: &'a [u64]) -> Self {
        Self::with_crc(symbols, CrcVariant::New)
    }

    /// Scan `symbols` using the given CRC polynomial.
    pub fn with_crc(symbols: &'a [u64], crc: CrcVariant) -> Self {
        Self {
            symbols: symbols.iter(),
            crc,
            open: None,
            busy: false,
            chunk_busy: false,
            stray_words: 0,
            unknown_kchars: 0,
        }
    }

    /// Data words seen outside any chunk so far.
    pub fn stray_words(&self) -> usize {
        self.stray_words
    }

    /// K-characters with an unrecognised code seen so far.
    pub fn unknown_kchars(&self) -> usize {
        self.unknown_kchars
    }
}

impl Iterator for FrameScanner<'_> {
    type Item = ScanItem;

    fn next(&mut self) -> Option<ScanItem> {
        for &word in self.symbols.by_ref() {
            match Symbol::decode(word) {
                Symbol::Sop => {
                    self.chunk_busy = self.busy;
                    if let Some(prev) = self.open.replace(Vec::new()) {
                        return Some(ScanItem::Truncated { words: prev.len() });
                    }
                }
                Symbol::Eop { crc } => {
                    let Some(words) = self.open.take() else {
                        return Some(ScanItem::Orphan { crc });
                    };
                    let crc_computed = crc20(&words, self.crc);
                    return Some(ScanItem::Chunk(ScannedChunk {
                        words,
                        crc_expected: crc,
                        crc_computed,
                        busy: self.chunk_busy,
                    }));
                }
                Symbol::Data(d) => match self.open.as_mut() {
                    Some(words) => words.push(d),
                    None => self.stray_words += 1,
                },
                Symbol::Sob => {
                    self.busy = true;
                    self.chunk_busy = true;
                }
                Symbol::Eob => self.busy = false,
                Symbol::Idle => {}
                Symbol::Unknown(_) => self.unknown_kchars += 1,
            }
        }
        self.open
            .take()
            .map(|words| ScanItem::Truncated { words: words.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::{synthesize, EmuOptions};
    use crate::symbols::{eop_with_crc, EOB, IDLE, SOB, SOP};

    fn scan(opts: &EmuOptions) -> Vec<ScanItem> {
        let mut buf = vec![0u64; 1024];
        synthesize(&mut buf, opts);
        FrameScanner::with_crc(&buf, opts.crc).collect()
    }

    #[test]
    fn clean_stream_scans_clean() {
        let items = scan(&EmuOptions::default());
        assert_eq!(items.len(), 8);
        for (i, item) in items.iter().enumerate() {
            let chunk = item.as_chunk().expect("complete chunk");
            assert!(chunk.crc_ok());
            assert!(chunk.size_ok());
            assert_eq!(chunk.header().map(|h| h.counter), Some(i as u8));
            assert!(!chunk.busy);
        }
    }

    #[test]
    fn legacy_polynomial_is_not_accepted_by_new_checker() {
        let opts = EmuOptions {
            crc: CrcVariant::Legacy,
            ..EmuOptions::default()
        };
        let mut buf = vec![0u64; 1024];
        synthesize(&mut buf, &opts);
        let new: Vec<_> = FrameScanner::with_crc(&buf, CrcVariant::New).collect();
        assert!(new.iter().all(|i| i.as_chunk().is_some_and(|c| !c.crc_ok())));
        let legacy: Vec<_> = FrameScanner::with_crc(&buf, CrcVariant::Legacy).collect();
        assert!(legacy.iter().all(|i| i.as_chunk().is_some_and(ScannedChunk::crc_ok)));
    }

    #[test]
    fn missing_sop_yields_orphan() {
        let opts = EmuOptions {
            omit_sop: true,
            ..EmuOptions::default()
        };
        let mut buf = vec![0u64; 1024];
        synthesize(&mut buf, &opts);
        let mut scanner = FrameScanner::new(&buf);
        let items: Vec<_> = scanner.by_ref().collect();
        assert!(matches!(items[2], ScanItem::Orphan { .. }));
        assert_eq!(items.iter().filter(|i| i.as_chunk().is_some()).count(), 7);
        assert_eq!(scanner.stray_words(), 116);
    }

    #[test]
    fn missing_eop_yields_truncated() {
        let opts = EmuOptions {
            omit_eop: true,
            ..EmuOptions::default()
        };
        let items = scan(&opts);
        assert_eq!(items[2], ScanItem::Truncated { words: 116 });
        assert_eq!(items.iter().filter(|i| i.as_chunk().is_some()).count(), 7);
    }

    #[test]
    fn corrupted_crc_is_flagged() {
        let opts = EmuOptions {
            crc_error: true,
            ..EmuOptions::default()
        };
        let items = scan(&opts);
        let bad: Vec<_> = items
            .iter()
            .enumerate()
            .filter(|(_, i)| !i.as_chunk().is_some_and(ScannedChunk::crc_ok))
            .map(|(n, _)| n)
            .collect();
        assert_eq!(bad, [3]);
    }

    #[test]
    fn busy_bracket_marks_chunk() {
        let stream = [IDLE, SOB, SOP, 1, 2, eop_with_crc(crc20(&[1, 2], CrcVariant::New)), EOB];
        let items: Vec<_> = FrameScanner::new(&stream).collect();
        let chunk = items[0].as_chunk().expect("chunk");
        assert!(chunk.busy);
        assert!(chunk.crc_ok());
    }

    #[test]
    fn stream_ending_inside_chunk() {
        let stream = [SOP, 1, 2, 3];
        let items: Vec<_> = FrameScanner::new(&stream).collect();
        assert_eq!(items, [ScanItem::Truncated { words: 3 }]);
    }
}
