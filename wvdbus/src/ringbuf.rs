//! Chunked byte queue used for socket read buffering and outgoing data.
//!
//! Bytes are appended at the tail and consumed from the head. Storage is a
//! list of fixed-size chunks, so neither side ever shifts existing data:
//! empty chunks are released from the head and new chunks are allocated at
//! the tail.

use std::collections::VecDeque;
use std::io::IoSlice;

/// Size of one storage chunk.
pub const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub struct RingBuffer {
    chunks: VecDeque<Box<[u8]>>,
    /// Read offset into the first chunk.
    head: usize,
    /// Write offset into the last chunk.
    tail: usize,
    chunk_size: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    /// Create a buffer with a non-default chunk size.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        RingBuffer {
            chunks: VecDeque::new(),
            head: 0,
            tail: 0,
            chunk_size,
            len: 0,
        }
    }

    /// Number of readable bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the tail of the buffer.
    pub fn append(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.chunks.is_empty() || self.tail == self.chunk_size {
                self.chunks
                    .push_back(vec![0u8; self.chunk_size].into_boxed_slice());
                self.tail = 0;
            }

            let n = {
                let Some(last) = self.chunks.back_mut() else {
                    break;
                };
                let n = data.len().min(self.chunk_size - self.tail);
                last[self.tail..self.tail + n].copy_from_slice(&data[..n]);
                n
            };

            self.tail += n;
            self.len += n;
            data = &data[n..];
        }
    }

    /// Copy `into.len()` bytes from the head without consuming them.
    ///
    /// Returns `false`, leaving `into` untouched, if fewer bytes are buffered.
    pub fn peek(&self, into: &mut [u8]) -> bool {
        if into.len() > self.len {
            return false;
        }

        let mut copied = 0;
        for slice in self.slices() {
            if copied == into.len() {
                break;
            }
            let n = slice.len().min(into.len() - copied);
            into[copied..copied + n].copy_from_slice(&slice[..n]);
            copied += n;
        }
        true
    }

    /// Copy `into.len()` bytes from the head and consume them.
    ///
    /// Returns `false`, consuming nothing, if fewer bytes are buffered.
    pub fn retrieve(&mut self, into: &mut [u8]) -> bool {
        if !self.peek(into) {
            return false;
        }
        self.discard(into.len());
        true
    }

    /// Consume up to `count` bytes from the head; returns how many were dropped.
    pub fn discard(&mut self, count: usize) -> usize {
        let count = count.min(self.len);
        let mut remaining = count;

        while remaining > 0 {
            let end = self.chunk_end(0);
            let n = remaining.min(end - self.head);
            self.head += n;
            remaining -= n;
            self.len -= n;

            if self.head == end {
                self.release_head();
            }
        }

        if self.len == 0 {
            self.chunks.clear();
            self.head = 0;
            self.tail = 0;
        }

        count
    }

    /// Take everything out of the buffer.
    pub fn take_all(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.retrieve(&mut out);
        out
    }

    /// The readable byte ranges, head first, without copying.
    pub fn slices(&self) -> Vec<&[u8]> {
        let mut out = Vec::with_capacity(self.chunks.len());
        for (i, chunk) in self.chunks.iter().enumerate() {
            let start = if i == 0 { self.head } else { 0 };
            let end = self.chunk_end(i);
            if end > start {
                out.push(&chunk[start..end]);
            }
        }
        out
    }

    /// The readable byte ranges as [`IoSlice`]s, for vectored writes.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.slices().into_iter().map(IoSlice::new).collect()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }

    fn chunk_end(&self, index: usize) -> usize {
        if index + 1 == self.chunks.len() {
            self.tail
        } else {
            self.chunk_size
        }
    }

    fn release_head(&mut self) {
        self.chunks.pop_front();
        self.head = 0;
        if self.chunks.is_empty() {
            self.tail = 0;
        }
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
