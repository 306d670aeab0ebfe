//! File assembly
//!
//! Tracks which byte ranges of a file are already on disk and finds the
//! next hole worth requesting. The transfer core only talks to the
//! [`FileAssembly`] trait; [`MemoryAssembly`] keeps everything in memory and
//! backs the tests.

use crate::error::{Result, StorageErrorKind, TransferError};
use crate::types::{ByteRange, RangeSet};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Constraints for [`FileAssembly::find_hole`]
#[derive(Debug, Clone, Copy, Default)]
pub struct HoleQuery<'a> {
    /// Largest hole to hand out; zero means up to the end of the file
    pub chunk_size: u64,
    /// Only consider bytes inside these ranges (peer's advertised availability)
    pub within: Option<&'a RangeSet>,
    /// Ranges claimed by other running Sources
    pub busy: &'a [ByteRange],
}

/// Outcome of a hole search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hole {
    /// A range nobody is fetching yet
    Range(ByteRange),
    /// Every missing byte is claimed or not available here
    Busy,
    /// Nothing is missing
    Done,
}

/// Local completion of a range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Empty,
    Partial,
    Done,
}

/// Description of a file handed to an [`AssemblyProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub name: String,
    pub size: Option<u64>,
    pub hash: Option<String>,
    pub swarming: bool,
}

/// On-disk state of one file being downloaded
pub trait FileAssembly: Send {
    /// File size, once known
    fn size(&self) -> Option<u64>;

    fn find_hole(&self, query: &HoleQuery<'_>) -> Hole;

    fn chunk_status(&self, range: ByteRange) -> ChunkStatus;

    fn mark_done(&mut self, range: ByteRange);

    /// Forget previously written bytes so they are fetched again
    fn mark_empty(&mut self, range: ByteRange);

    /// Read stored bytes at `offset`, returning how many were read
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn on_size_known(&mut self, total: u64);

    fn is_complete(&self) -> bool;

    /// Adjust the number of live Sources for this file, returning the new count
    fn lifecount(&mut self, delta: i64) -> usize;
}

/// Opens assemblies for new or restored files
pub trait AssemblyProvider: Send {
    fn open(&mut self, spec: &FileSpec) -> Result<Box<dyn FileAssembly>>;
}

/// In-memory [`FileAssembly`]
#[derive(Debug, Default)]
pub struct MemoryAssembly {
    size: Option<u64>,
    data: Vec<u8>,
    done: RangeSet,
    live: usize,
    /// Fail every write with this message
    fail_writes: Option<String>,
}

impl MemoryAssembly {
    pub fn new(size: Option<u64>) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Pre-populate `range` with `data` as if downloaded earlier
    pub fn with_done(mut self, offset: u64, data: &[u8]) -> Self {
        self.store(offset, data);
        self.done
            .insert(ByteRange::new(offset, offset + data.len() as u64));
        self
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&mut self, message: impl Into<String>) {
        self.fail_writes = Some(message.into());
    }

    /// Ranges already present
    pub fn done(&self) -> &RangeSet {
        &self.done
    }

    /// Raw stored bytes
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn store(&mut self, offset: u64, data: &[u8]) {
        let start = offset as usize;
        let end = start + data.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
    }

    fn extent(&self) -> ByteRange {
        ByteRange::new(0, self.size.unwrap_or(u64::MAX))
    }
}

impl FileAssembly for MemoryAssembly {
    fn size(&self) -> Option<u64> {
        self.size
    }

    fn find_hole(&self, query: &HoleQuery<'_>) -> Hole {
        let missing = self.done.gaps(self.extent());
        if missing.is_empty() {
            return Hole::Done;
        }

        let mut claimed = RangeSet::from_ranges(query.busy.iter().copied());
        if let Some(within) = query.within {
            // Bytes the peer lacks count as unavailable
            for gap in within.gaps(self.extent()) {
                claimed.insert(gap);
            }
        }

        for gap in missing {
            if let Some(free) = claimed.gaps(gap).into_iter().next() {
                let end = if query.chunk_size == 0 {
                    if query.within.is_some() || !query.busy.is_empty() {
                        free.end
                    } else {
                        self.extent().end
                    }
                } else {
                    free.end.min(free.start.saturating_add(query.chunk_size))
                };
                return Hole::Range(ByteRange::new(free.start, end));
            }
        }
        Hole::Busy
    }

    fn chunk_status(&self, range: ByteRange) -> ChunkStatus {
        if range.is_empty() || self.done.covers(&range) {
            return ChunkStatus::Done;
        }
        if self.done.gaps(range) == vec![range] {
            ChunkStatus::Empty
        } else {
            ChunkStatus::Partial
        }
    }

    fn mark_done(&mut self, range: ByteRange) {
        self.done.insert(range);
    }

    fn mark_empty(&mut self, range: ByteRange) {
        self.done.remove(range);
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let start = offset as usize;
        if start >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if let Some(message) = &self.fail_writes {
            return Err(TransferError::storage(
                StorageErrorKind::Io,
                "<memory>",
                message.clone(),
            ));
        }
        if let Some(size) = self.size {
            if offset + data.len() as u64 > size {
                return Err(TransferError::storage(
                    StorageErrorKind::Io,
                    "<memory>",
                    format!(
                        "Write of {} bytes at {} past end of {} byte file",
                        data.len(),
                        offset,
                        size
                    ),
                ));
            }
        }
        self.store(offset, data);
        Ok(())
    }

    fn on_size_known(&mut self, total: u64) {
        if self.size.is_none() {
            self.size = Some(total);
        }
    }

    fn is_complete(&self) -> bool {
        match self.size {
            Some(size) => self.done.covers(&ByteRange::new(0, size)),
            None => false,
        }
    }

    fn lifecount(&mut self, delta: i64) -> usize {
        self.live = (self.live as i64 + delta).max(0) as usize;
        self.live
    }
}

/// Shared handle to a [`MemoryAssembly`], so callers can inspect it while
/// the transfer core owns the boxed trait object
#[derive(Debug, Clone, Default)]
pub struct SharedAssembly(pub Arc<Mutex<MemoryAssembly>>);

impl SharedAssembly {
    pub fn new(assembly: MemoryAssembly) -> Self {
        Self(Arc::new(Mutex::new(assembly)))
    }
}

impl FileAssembly for SharedAssembly {
    fn size(&self) -> Option<u64> {
        self.0.lock().size()
    }

    fn find_hole(&self, query: &HoleQuery<'_>) -> Hole {
        self.0.lock().find_hole(query)
    }

    fn chunk_status(&self, range: ByteRange) -> ChunkStatus {
        self.0.lock().chunk_status(range)
    }

    fn mark_done(&mut self, range: ByteRange) {
        self.0.lock().mark_done(range)
    }

    fn mark_empty(&mut self, range: ByteRange) {
        self.0.lock().mark_empty(range)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.0.lock().read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.0.lock().write_at(offset, data)
    }

    fn on_size_known(&mut self, total: u64) {
        self.0.lock().on_size_known(total)
    }

    fn is_complete(&self) -> bool {
        self.0.lock().is_complete()
    }

    fn lifecount(&mut self, delta: i64) -> usize {
        self.0.lock().lifecount(delta)
    }
}

/// Provider of in-memory assemblies, keyed by file name
#[derive(Debug, Clone, Default)]
pub struct MemoryAssemblyProvider {
    opened: Arc<Mutex<HashMap<String, SharedAssembly>>>,
}

impl MemoryAssemblyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pre-populated assembly to be handed out for `name`
    pub fn preload(&self, name: impl Into<String>, assembly: MemoryAssembly) -> SharedAssembly {
        let shared = SharedAssembly::new(assembly);
        self.opened.lock().insert(name.into(), shared.clone());
        shared
    }

    /// Assembly previously opened for `name`
    pub fn get(&self, name: &str) -> Option<SharedAssembly> {
        self.opened.lock().get(name).cloned()
    }
}

impl AssemblyProvider for MemoryAssemblyProvider {
    fn open(&mut self, spec: &FileSpec) -> Result<Box<dyn FileAssembly>> {
        let shared = self
            .opened
            .lock()
            .entry(spec.name.clone())
            .or_insert_with(|| SharedAssembly::new(MemoryAssembly::new(spec.size)))
            .clone();
        if let Some(size) = spec.size {
            shared.0.lock().on_size_known(size);
        }
        Ok(Box::new(shared))
    }
}
