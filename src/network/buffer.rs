//! Connection Buffers
//!
//! [`ReadBuffer`] accumulates bytes from the socket until the protocol
//! interpreter can decode a full message; TCP is a stream, so one read may
//! hold half a command or several pipelined ones. [`WriteQueue`] collects
//! encoded responses and decides when they are worth flushing, so a batch of
//! pipelined replies goes out in one write.

use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Bytes pulled from the socket per read call
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Inbound bytes not yet consumed by the interpreter.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: BytesMut,
    limit: usize,
}

impl ReadBuffer {
    /// Creates an empty buffer that refuses to grow past `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE.min(limit)),
            limit,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes that may still be buffered before hitting the limit.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// Drops `n` decoded bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    /// Appends bytes directly (used by tests and in-memory transports).
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Performs one read from `reader` into the buffer.
    ///
    /// Returns the number of bytes read; 0 means end of stream. The buffer
    /// must not be full.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let want = self.remaining().min(READ_CHUNK_SIZE);
        debug_assert!(want > 0, "fill_from called on a full read buffer");
        let n = reader.read(&mut chunk[..want])?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Empties the buffer, keeping its allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Outbound encoded responses.
#[derive(Debug)]
pub struct WriteQueue {
    buf: BytesMut,
    flush_requested: bool,
    flush_threshold: usize,
}

impl WriteQueue {
    /// Creates an empty queue that wants flushing once `flush_threshold`
    /// bytes are pending.
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            flush_requested: false,
            flush_threshold,
        }
    }

    /// The buffer responses are encoded into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn push(&mut self, frame: &[u8]) {
        self.buf.extend_from_slice(frame);
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Asks for the queue to be flushed at the next opportunity.
    pub fn force_flush(&mut self) {
        self.flush_requested = true;
    }

    pub fn flush_requested(&self) -> bool {
        self.flush_requested
    }

    /// True when a flush was requested or the threshold is reached.
    pub fn should_flush(&self) -> bool {
        self.flush_requested || self.buf.len() >= self.flush_threshold
    }

    /// Performs one write of pending bytes to `writer`, dropping what was sent.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(&self.buf)?;
        self.buf.advance(n);
        Ok(n)
    }

    /// Marks everything as sent; called once the queue drained.
    pub fn flushed(&mut self) {
        self.flush_requested = false;
    }

    /// Drops pending bytes and any flush request, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.flush_requested = false;
    }
}
