//! Retry-time index
//!
//! Peers with pending work are bucketed by a hash of their `retry_after`
//! time. Each bucket is kept sorted ascending by `(retry_after, peer)` so a
//! scan can stop at the first peer that is not yet due. Every insert or
//! removal bumps the bucket's generation; a scan captures the generation up
//! front and restarts when it changes underneath it.

use crate::types::{PeerId, Timestamp};

#[derive(Debug, Default, Clone)]
struct Bucket {
    entries: Vec<(Timestamp, PeerId)>,
    generation: u64,
}

/// Peers bucketed by retry time
#[derive(Debug, Clone)]
pub struct RetryIndex {
    buckets: Vec<Bucket>,
    mask: u64,
}

/// Position in a bucket, valid only while the generation is unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketCursor {
    pub bucket: usize,
    pub generation: u64,
    pub pos: usize,
}

impl RetryIndex {
    /// Create an index with `buckets` buckets (rounded up to a power of two)
    pub fn new(buckets: usize) -> Self {
        let n = buckets.max(1).next_power_of_two();
        Self {
            buckets: vec![Bucket::default(); n],
            mask: n as u64 - 1,
        }
    }

    /// Bucket holding peers due at `at`
    pub fn bucket_of(&self, at: Timestamp) -> usize {
        (at.as_secs() & self.mask) as usize
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Insert a peer; it must not already be present under this time
    pub fn insert(&mut self, at: Timestamp, peer: PeerId) {
        let bucket = &mut self.buckets[(at.as_secs() & self.mask) as usize];
        let key = (at, peer);
        let pos = bucket.entries.partition_point(|e| *e < key);
        debug_assert!(bucket.entries.get(pos) != Some(&key), "{} indexed twice", peer);
        bucket.entries.insert(pos, key);
        bucket.generation += 1;
    }

    /// Remove a peer previously inserted under `at`. Returns whether it was found.
    pub fn remove(&mut self, at: Timestamp, peer: PeerId) -> bool {
        let bucket = &mut self.buckets[(at.as_secs() & self.mask) as usize];
        let key = (at, peer);
        match bucket.entries.binary_search(&key) {
            Ok(pos) => {
                bucket.entries.remove(pos);
                bucket.generation += 1;
                true
            }
            Err(_) => false,
        }
    }

    /// Current generation of a bucket
    pub fn generation(&self, bucket: usize) -> u64 {
        self.buckets[bucket].generation
    }

    /// Begin a generation-checked walk of a bucket
    pub fn cursor(&self, bucket: usize) -> BucketCursor {
        BucketCursor {
            bucket,
            generation: self.buckets[bucket].generation,
            pos: 0,
        }
    }

    /// Next entry due at or before `now`.
    ///
    /// Returns `Err(())` when the bucket changed since the cursor was taken;
    /// the caller must restart with a fresh cursor. `Ok(None)` means the walk
    /// reached the end of the bucket or the first entry still in the future.
    #[allow(clippy::result_unit_err)]
    pub fn next_due(
        &self,
        cursor: &mut BucketCursor,
        now: Timestamp,
    ) -> Result<Option<(Timestamp, PeerId)>, ()> {
        let bucket = &self.buckets[cursor.bucket];
        if bucket.generation != cursor.generation {
            return Err(());
        }
        match bucket.entries.get(cursor.pos) {
            Some(&(at, peer)) if at <= now => {
                cursor.pos += 1;
                Ok(Some((at, peer)))
            }
            _ => Ok(None),
        }
    }

    /// Entries of one bucket, in order
    pub fn bucket_entries(&self, bucket: usize) -> &[(Timestamp, PeerId)] {
        &self.buckets[bucket].entries
    }

    /// Total indexed peers
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    /// Whether every bucket is sorted ascending
    pub fn is_sorted(&self) -> bool {
        self.buckets
            .iter()
            .all(|b| b.entries.windows(2).all(|w| w[0] <= w[1]))
    }
}
