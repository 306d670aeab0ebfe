//! Buffer pool and scatter/gather receive buffers
//!
//! A bounded pool of fixed-size chunks that receiving sources borrow from.
//! Acquisition never blocks: when the pool is exhausted the caller gets
//! `None` and is expected to requeue the source instead of waiting.

use bytes::BytesMut;

/// Bounded pool of reusable I/O chunks
#[derive(Debug)]
pub struct BufferPool {
    /// Size of each chunk
    chunk_size: usize,
    /// Maximum number of chunks handed out at once
    max_chunks: usize,
    /// Chunks currently lent out
    outstanding: usize,
    /// Released chunks kept for reuse
    free: Vec<BytesMut>,
}

impl BufferPool {
    /// Create a pool lending at most `max_chunks` chunks of `chunk_size` bytes
    pub fn new(chunk_size: usize, max_chunks: usize) -> Self {
        Self {
            chunk_size,
            max_chunks,
            outstanding: 0,
            free: Vec::new(),
        }
    }

    /// Size of one chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Borrow exactly `n` chunks, or nothing if fewer are available
    pub fn acquire(&mut self, n: usize) -> Option<Vec<BytesMut>> {
        if self.outstanding + n > self.max_chunks {
            tracing::trace!(
                "Buffer pool exhausted: {} lent, {} requested, {} max",
                self.outstanding,
                n,
                self.max_chunks
            );
            return None;
        }

        let mut chunks = Vec::with_capacity(n);
        for _ in 0..n {
            let chunk = self
                .free
                .pop()
                .unwrap_or_else(|| BytesMut::with_capacity(self.chunk_size));
            chunks.push(chunk);
        }
        self.outstanding += n;
        Some(chunks)
    }

    /// Give chunks back to the pool
    pub fn release(&mut self, chunks: Vec<BytesMut>) {
        let n = chunks.len();
        debug_assert!(n <= self.outstanding, "released more chunks than lent");
        self.outstanding = self.outstanding.saturating_sub(n);
        for mut chunk in chunks {
            chunk.clear();
            self.free.push(chunk);
        }
    }

    /// Chunks that can still be lent
    pub fn available(&self) -> usize {
        self.max_chunks - self.outstanding
    }

    /// Chunks currently lent out
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Whether a source's buffers are filling up or being written out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Reading,
    Writing,
}

/// Scatter/gather receive buffers of one source.
///
/// The first chunk is the socket's own receive buffer; the others are
/// borrowed from the [`BufferPool`] and must be released through
/// [`Buffers::into_parts`].
#[derive(Debug)]
pub struct Buffers {
    chunks: Vec<BytesMut>,
    /// Fill limit of each chunk
    limits: Vec<usize>,
    /// Chunk currently being filled
    cursor: usize,
    held: usize,
    capacity: usize,
    mode: BufferMode,
}

impl Buffers {
    /// Assemble buffers from the socket's chunk and pooled chunks
    pub fn new(socket_chunk: BytesMut, borrowed: Vec<BytesMut>, chunk_size: usize) -> Self {
        let mut socket_chunk = socket_chunk;
        socket_chunk.clear();
        let first_limit = socket_chunk.capacity().max(1);

        let mut limits = Vec::with_capacity(borrowed.len() + 1);
        limits.push(first_limit);
        limits.extend(std::iter::repeat(chunk_size).take(borrowed.len()));

        let mut chunks = Vec::with_capacity(borrowed.len() + 1);
        chunks.push(socket_chunk);
        chunks.extend(borrowed);

        let capacity = limits.iter().sum();
        Self {
            chunks,
            limits,
            cursor: 0,
            held: 0,
            capacity,
            mode: BufferMode::Reading,
        }
    }

    /// Copy as much of `data` as fits, advancing the scatter cursor.
    /// Returns the number of bytes consumed.
    pub fn add_read(&mut self, data: &[u8]) -> usize {
        debug_assert_eq!(self.mode, BufferMode::Reading);
        let mut consumed = 0;

        while consumed < data.len() && self.cursor < self.chunks.len() {
            let chunk = &mut self.chunks[self.cursor];
            let room = self.limits[self.cursor] - chunk.len();
            if room == 0 {
                self.cursor += 1;
                continue;
            }
            let n = room.min(data.len() - consumed);
            chunk.extend_from_slice(&data[consumed..consumed + n]);
            consumed += n;
        }

        self.held += consumed;
        debug_assert!(self.held <= self.capacity);
        consumed
    }

    /// Bytes currently held
    pub fn held(&self) -> usize {
        self.held
    }

    /// Total bytes these buffers can hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room left before a flush is mandatory
    pub fn free(&self) -> usize {
        self.capacity - self.held
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Flush policy: enough held, too little room for another read, or the
    /// held bytes already reach the end of the requested range.
    pub fn should_flush(&self, threshold: usize, min_read: usize, range_remaining: u64) -> bool {
        if self.held == 0 {
            return false;
        }
        self.held >= threshold || self.free() < min_read || self.held as u64 >= range_remaining
    }

    /// Hand the held bytes to `write` as one contiguous slice, then empty
    /// the buffers. The mode is `Writing` for the duration of the call.
    pub fn flush_with<R>(&mut self, write: impl FnOnce(&[u8]) -> R) -> R {
        self.mode = BufferMode::Writing;

        let result = if self.cursor == 0 || self.chunks[1..].iter().all(|c| c.is_empty()) {
            write(&self.chunks[0][..])
        } else {
            let mut gathered = Vec::with_capacity(self.held);
            for chunk in &self.chunks {
                gathered.extend_from_slice(chunk);
            }
            write(&gathered)
        };

        for chunk in &mut self.chunks {
            chunk.clear();
        }
        self.cursor = 0;
        self.held = 0;
        self.mode = BufferMode::Reading;
        result
    }

    /// Split back into the socket's chunk and the borrowed chunks
    pub fn into_parts(mut self) -> (BytesMut, Vec<BytesMut>) {
        let first = self.chunks.remove(0);
        (first, self.chunks)
    }
}
