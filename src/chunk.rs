//! Byte-range allocation
//!
//! Chooses the next range a Source should request. Swarmed files are split
//! into chunks so several peers can serve the same file at once; a peer that
//! only has part of the file (partial file sharing) is only asked for bytes
//! it advertises.

use crate::assembly::{ChunkStatus, FileAssembly, Hole, HoleQuery};
use crate::types::{ByteRange, RangeSet};

/// What a Source should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Request `[start, end)`, preceded by `overlap` already-held bytes
    Range { start: u64, end: u64, overlap: u64 },
    /// Everything missing is claimed elsewhere or not offered by this peer
    Busy,
    /// Nothing left to fetch
    Done,
}

/// Inputs describing the requesting Source
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkRequest<'a> {
    pub swarming: bool,
    /// Ranges the peer advertises, if it only has part of the file
    pub availability: Option<&'a RangeSet>,
    /// Ranges other running Sources are already fetching
    pub busy: &'a [ByteRange],
}

/// Range allocator for one transfer manager
#[derive(Debug, Clone)]
pub struct ChunkAllocator {
    overlap_size: u64,
    swarm_chunk_size: u64,
}

impl ChunkAllocator {
    pub fn new(overlap_size: u64, swarm_chunk_size: u64) -> Self {
        Self {
            overlap_size,
            swarm_chunk_size,
        }
    }

    pub fn allocate(&self, assembly: &dyn FileAssembly, request: &ChunkRequest<'_>) -> Allocation {
        let hole = if request.swarming {
            assembly.find_hole(&HoleQuery {
                chunk_size: self.swarm_chunk_size,
                within: request.availability,
                busy: request.busy,
            })
        } else {
            assembly.find_hole(&HoleQuery {
                chunk_size: 0,
                within: request.availability,
                busy: request.busy,
            })
        };

        match hole {
            Hole::Done => Allocation::Done,
            Hole::Busy => {
                tracing::trace!(
                    "No free range (swarming: {}, partial peer: {})",
                    request.swarming,
                    request.availability.is_some()
                );
                Allocation::Busy
            }
            Hole::Range(range) => Allocation::Range {
                start: range.start,
                end: range.end,
                overlap: self.overlap_for(assembly, range.start, request.availability),
            },
        }
    }

    /// Overlap window before `start`, or zero when those bytes are not all
    /// held locally or not all offered by the peer
    fn overlap_for(&self, assembly: &dyn FileAssembly, start: u64, availability: Option<&RangeSet>) -> u64 {
        if self.overlap_size == 0 || start < self.overlap_size {
            return 0;
        }
        let window = ByteRange::new(start - self.overlap_size, start);
        if assembly.chunk_status(window) != ChunkStatus::Done {
            return 0;
        }
        if let Some(avail) = availability {
            if !avail.covers(&window) {
                return 0;
            }
        }
        self.overlap_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::MemoryAssembly;

    #[test]
    fn test_non_swarming_requests_to_end() {
        let assembly = MemoryAssembly::new(Some(1000)).with_done(0, &[0u8; 500]);
        let alloc = ChunkAllocator::new(64, 100);
        assert_eq!(
            alloc.allocate(&assembly, &ChunkRequest::default()),
            Allocation::Range {
                start: 500,
                end: 1000,
                overlap: 64
            }
        );
    }

    #[test]
    fn test_no_overlap_at_start() {
        let assembly = MemoryAssembly::new(Some(1000));
        let alloc = ChunkAllocator::new(64, 100);
        assert_eq!(
            alloc.allocate(&assembly, &ChunkRequest::default()),
            Allocation::Range {
                start: 0,
                end: 1000,
                overlap: 0
            }
        );
    }

    #[test]
    fn test_swarming_chunks() {
        let assembly = MemoryAssembly::new(Some(1000));
        let alloc = ChunkAllocator::new(0, 256);
        let busy = [ByteRange::new(0, 256)];
        let request = ChunkRequest {
            swarming: true,
            availability: None,
            busy: &busy,
        };
        assert_eq!(
            alloc.allocate(&assembly, &request),
            Allocation::Range {
                start: 256,
                end: 512,
                overlap: 0
            }
        );
    }

    #[test]
    fn test_partial_peer_constrains_range() {
        let assembly = MemoryAssembly::new(Some(1000)).with_done(0, &[0u8; 300]);
        let alloc = ChunkAllocator::new(64, 1000);
        let avail = RangeSet::from_ranges([ByteRange::new(700, 900)]);
        let request = ChunkRequest {
            swarming: true,
            availability: Some(&avail),
            busy: &[],
        };
        // Overlap would need 636..700 which is neither held nor offered
        assert_eq!(
            alloc.allocate(&assembly, &request),
            Allocation::Range {
                start: 700,
                end: 900,
                overlap: 0
            }
        );
    }

    #[test]
    fn test_overlap_needs_peer_coverage() {
        let assembly = MemoryAssembly::new(Some(1000)).with_done(0, &[0u8; 500]);
        let alloc = ChunkAllocator::new(64, 1000);

        let avail = RangeSet::from_ranges([ByteRange::new(450, 1000)]);
        let request = ChunkRequest {
            swarming: true,
            availability: Some(&avail),
            busy: &[],
        };
        assert_eq!(
            alloc.allocate(&assembly, &request),
            Allocation::Range {
                start: 500,
                end: 1000,
                overlap: 0
            }
        );

        let avail = RangeSet::from_ranges([ByteRange::new(400, 1000)]);
        let request = ChunkRequest {
            swarming: true,
            availability: Some(&avail),
            busy: &[],
        };
        assert_eq!(
            alloc.allocate(&assembly, &request),
            Allocation::Range {
                start: 500,
                end: 1000,
                overlap: 64
            }
        );
    }

    #[test]
    fn test_busy_and_done() {
        let alloc = ChunkAllocator::new(0, 100);
        let assembly = MemoryAssembly::new(Some(100));
        let avail = RangeSet::new();
        let request = ChunkRequest {
            swarming: true,
            availability: Some(&avail),
            busy: &[],
        };
        assert_eq!(alloc.allocate(&assembly, &request), Allocation::Busy);

        let assembly = MemoryAssembly::new(Some(100)).with_done(0, &[0u8; 100]);
        assert_eq!(
            alloc.allocate(&assembly, &ChunkRequest::default()),
            Allocation::Done
        );
    }
}
