//! Core types for gosh-swarm
//!
//! Identifiers, peer identities, timestamps and byte ranges shared by every
//! component of the transfer core.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::ops::{Add, Sub};
use std::time::Duration;
use uuid::Uuid;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub(crate) u64);

        impl $name {
            /// Raw numeric value
            pub fn get(&self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Handle of a Source inside a `TransferManager`
    SourceId,
    "src"
);
arena_id!(
    /// Handle of a Peer inside the `PeerRegistry`
    PeerId,
    "peer"
);
arena_id!(
    /// Handle of a file registered with a `TransferManager`
    FileId,
    "file"
);

/// Identity of one logical request, distinct from the Source carrying it.
///
/// A Source serving several ranges over one keep-alive connection gets a
/// fresh `AttemptId` per request, so every request keeps its own history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(Uuid);

impl AttemptId {
    /// Create a new random attempt ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0.as_bytes()[0..8]))
    }
}

/// 16-byte overlay identity of a servent. All zeroes means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// The unknown GUID
    pub const BLANK: Guid = Guid([0u8; 16]);

    /// Whether this GUID is unknown
    pub fn is_blank(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Hex representation (32 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 32-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_blank() {
            write!(f, "<blank>")
        } else {
            write!(f, "{}", self.to_hex())
        }
    }
}

/// How a remote peer is identified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub guid: Guid,
    pub addr: SocketAddr,
}

impl PeerIdentity {
    pub fn new(guid: Guid, addr: SocketAddr) -> Self {
        Self { guid, addr }
    }

    /// Identity with an unknown GUID
    pub fn anonymous(addr: SocketAddr) -> Self {
        Self {
            guid: Guid::BLANK,
            addr,
        }
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.addr, self.guid)
    }
}

/// Milliseconds since the clock's epoch.
///
/// Plain integers keep retry-time bucketing, persistence and fake clocks
/// trivial; `Instant` has no absolute value to hash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.as_millis() as u64))
    }
}

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }

    /// Whether `other` lies entirely inside this range
    pub fn covers(&self, other: &ByteRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Overlapping part of two ranges, if any
    pub fn intersect(&self, other: &ByteRange) -> Option<ByteRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(ByteRange { start, end })
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "[empty@{}]", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end - 1)
        }
    }
}

/// Sorted, coalesced set of byte ranges a peer advertises (PFSP)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary ranges; overlapping and adjacent ones are merged
    pub fn from_ranges(ranges: impl IntoIterator<Item = ByteRange>) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert(range);
        }
        set
    }

    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        self.ranges.push(range);
        self.ranges.sort();
        let mut merged: Vec<ByteRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    /// Take `range` out of the set, splitting ranges as needed
    pub fn remove(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= range.start || r.start >= range.end {
                kept.push(r);
                continue;
            }
            if r.start < range.start {
                kept.push(ByteRange::new(r.start, range.start));
            }
            if r.end > range.end {
                kept.push(ByteRange::new(range.end, r.end));
            }
        }
        self.ranges = kept;
    }

    /// Parts of `within` not in the set, in order
    pub fn gaps(&self, within: ByteRange) -> Vec<ByteRange> {
        let mut gaps = Vec::new();
        let mut cursor = within.start;
        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start >= within.end {
                break;
            }
            if r.start > cursor {
                gaps.push(ByteRange::new(cursor, r.start.min(within.end)));
            }
            cursor = cursor.max(r.end);
            if cursor >= within.end {
                break;
            }
        }
        if cursor < within.end {
            gaps.push(ByteRange::new(cursor, within.end));
        }
        gaps
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    /// Whether the whole of `range` is advertised
    pub fn covers(&self, range: &ByteRange) -> bool {
        range.is_empty() || self.ranges.iter().any(|r| r.covers(range))
    }

    /// Total advertised bytes
    pub fn total(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }
}
