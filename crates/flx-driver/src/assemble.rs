// SPDX-License-Identifier: AGPL-3.0-only

//! Ready-made payload handlers.
//!
//! The assemblers turn parser callbacks into owned [`Bytes`] payloads and
//! hand them to a [`PayloadSink`]. Sinks never block: a payload that cannot
//! be delivered is dropped and counted.

use crate::parser::{Chunk, PayloadHandler, ShortChunk};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Copy `src` into the circular buffer `dst` starting at `pos`, wrapping at
/// the end. Returns the position after the last byte written.
pub fn copy_wrapping(src: &[u8], dst: &mut [u8], pos: usize) -> usize {
    if dst.is_empty() {
        return 0;
    }
    let mut pos = pos % dst.len();
    let mut rest = src;
    while !rest.is_empty() {
        let n = rest.len().min(dst.len() - pos);
        dst[pos..pos + n].copy_from_slice(&rest[..n]);
        rest = &rest[n..];
        pos = (pos + n) % dst.len();
    }
    pos
}

/// Destination for assembled payloads.
pub trait PayloadSink: Send + 'static {
    /// Offer a payload without blocking. Returns `false` if it was refused.
    fn offer(&mut self, payload: Bytes) -> bool;
}

impl PayloadSink for crossbeam_channel::Sender<Bytes> {
    fn offer(&mut self, payload: Bytes) -> bool {
        self.try_send(payload).is_ok()
    }
}

impl PayloadSink for Vec<Bytes> {
    fn offer(&mut self, payload: Bytes) -> bool {
        self.push(payload);
        true
    }
}

fn contiguous(chunk: &Chunk<'_>) -> Bytes {
    if let [only] = chunk.fragments {
        return only.clone();
    }
    let mut buf = BytesMut::with_capacity(chunk.length);
    for f in chunk.fragments {
        buf.extend_from_slice(f);
    }
    buf.freeze()
}

/// Forwards every chunk and shortchunk, whatever its size.
#[derive(Debug)]
pub struct VariableSizeAssembler<S> {
    sink: S,
    error_sink: Option<S>,
    dropped: Arc<AtomicU64>,
}

impl<S: PayloadSink> VariableSizeAssembler<S> {
    /// Forward good payloads to `sink`; payloads with errors are discarded.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            error_sink: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Also forward payloads delivered with an error to `sink`.
    #[must_use]
    pub fn with_error_sink(mut self, sink: S) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Counter of payloads a sink refused.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// The good-payload sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn deliver(&mut self, payload: Bytes, error: bool) {
        let accepted = if error {
            match self.error_sink.as_mut() {
                Some(sink) => sink.offer(payload),
                None => return,
            }
        } else {
            self.sink.offer(payload)
        };
        if !accepted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<S: PayloadSink> PayloadHandler for VariableSizeAssembler<S> {
    fn chunk(&mut self, chunk: &Chunk<'_>) {
        self.deliver(contiguous(chunk), false);
    }

    fn chunk_with_error(&mut self, chunk: &Chunk<'_>) {
        self.deliver(contiguous(chunk), true);
    }

    fn shortchunk(&mut self, chunk: &ShortChunk<'_>) {
        self.deliver(Bytes::copy_from_slice(chunk.data), false);
    }

    fn shortchunk_with_error(&mut self, chunk: &ShortChunk<'_>) {
        self.deliver(Bytes::copy_from_slice(chunk.data), true);
    }
}

/// Forwards only chunks of exactly `size` bytes.
#[derive(Debug)]
pub struct FixedSizeAssembler<S> {
    size: usize,
    sink: S,
    unexpected: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl<S: PayloadSink> FixedSizeAssembler<S> {
    /// Forward chunks of `size` bytes to `sink`.
    pub fn new(size: usize, sink: S) -> Self {
        Self {
            size,
            sink,
            unexpected: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Expected chunk size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Counter of chunks ignored for having the wrong size.
    pub fn unexpected_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.unexpected)
    }

    /// Counter of chunks the sink refused.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    fn deliver(&mut self, len: usize, make: impl FnOnce() -> Bytes) {
        if len != self.size {
            self.unexpected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !self.sink.offer(make()) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<S: PayloadSink> PayloadHandler for FixedSizeAssembler<S> {
    fn chunk(&mut self, chunk: &Chunk<'_>) {
        self.deliver(chunk.length, || contiguous(chunk));
    }

    fn shortchunk(&mut self, chunk: &ShortChunk<'_>) {
        self.deliver(chunk.data.len(), || Bytes::copy_from_slice(chunk.data));
    }
}

/// Counts payloads and bytes without keeping them.
#[derive(Debug, Clone, Default)]
pub struct CountingHandler {
    payloads: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl CountingHandler {
    /// New handler with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Good payloads seen.
    pub fn payloads(&self) -> u64 {
        self.payloads.load(Ordering::Relaxed)
    }

    /// Bytes in good payloads.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Payloads delivered with an error.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn count(&self, len: usize) {
        self.payloads.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}

impl PayloadHandler for CountingHandler {
    fn chunk(&mut self, chunk: &Chunk<'_>) {
        self.count(chunk.length);
    }

    fn chunk_with_error(&mut self, _chunk: &Chunk<'_>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn shortchunk(&mut self, chunk: &ShortChunk<'_>) {
        self.count(chunk.data.len());
    }

    fn shortchunk_with_error(&mut self, _chunk: &ShortChunk<'_>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flx_format::block::{SubchunkFlags, SubchunkTrailer, SubchunkType};

    fn short(data: &[u8]) -> ShortChunk<'_> {
        ShortChunk {
            elink: 0,
            data,
            trailer: SubchunkTrailer::new(SubchunkType::Both, data.len(), SubchunkFlags::default()),
        }
    }

    #[test]
    fn wrapping_copy() {
        let mut dst = [0u8; 8];
        let pos = copy_wrapping(&[1, 2, 3, 4, 5], &mut dst, 6);
        assert_eq!(pos, 3);
        assert_eq!(dst, [3, 4, 5, 0, 0, 0, 1, 2]);
        assert_eq!(copy_wrapping(&[9; 20], &mut dst, 0), 4);
        assert_eq!(copy_wrapping(&[1], &mut [], 5), 0);
    }

    #[test]
    fn variable_joins_fragments() {
        let frags = [Bytes::from_static(b"abc"), Bytes::from_static(b"de")];
        let chunk = Chunk {
            elink: 0,
            fragments: &frags,
            length: 5,
        };
        let mut asm = VariableSizeAssembler::new(Vec::new());
        asm.chunk(&chunk);
        asm.shortchunk(&short(b"xyz"));
        asm.chunk_with_error(&chunk);
        assert_eq!(asm.sink(), &[Bytes::from_static(b"abcde"), Bytes::from_static(b"xyz")]);
    }

    #[test]
    fn error_sink_receives_errors() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let (etx, erx) = crossbeam_channel::bounded(4);
        let mut asm = VariableSizeAssembler::new(tx).with_error_sink(etx);
        asm.shortchunk(&short(b"one"));
        asm.shortchunk(&short(b"two"));
        asm.shortchunk_with_error(&short(b"bad"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(erx.try_recv().unwrap(), Bytes::from_static(b"bad"));
        assert_eq!(asm.dropped_counter().load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fixed_size_filters() {
        let mut asm = FixedSizeAssembler::new(4, Vec::new());
        asm.shortchunk(&short(b"1234"));
        asm.shortchunk(&short(b"123"));
        asm.shortchunk(&short(b"12345"));
        assert_eq!(asm.sink.len(), 1);
        assert_eq!(asm.unexpected_counter().load(Ordering::Relaxed), 2);
    }

    #[test]
    fn counting() {
        let mut h = CountingHandler::new();
        let probe = h.clone();
        h.shortchunk(&short(b"12345678"));
        h.shortchunk_with_error(&short(b"1"));
        assert_eq!(probe.payloads(), 1);
        assert_eq!(probe.bytes(), 8);
        assert_eq!(probe.errors(), 1);
    }
}
