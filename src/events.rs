//! Transfer events
//!
//! Everything observable that happens to a Source, a Peer or a file is
//! reported as a `TransferEvent`. The manager queues them; the service
//! broadcasts them to subscribers.

use crate::source::SourceStatus;
use crate::types::{AttemptId, ByteRange, FileId, PeerId, SourceId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Events emitted by the transfer core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    /// A file was registered
    FileAdded { file: FileId, name: String },
    /// A Source was created
    SourceAdded {
        source: SourceId,
        file: FileId,
        peer: PeerId,
    },
    /// A Source moved to another state
    StateChanged {
        source: SourceId,
        old_state: SourceStatus,
        new_state: SourceStatus,
    },
    /// One request finished; the Source may continue with a new attempt
    AttemptCompleted {
        source: SourceId,
        attempt: AttemptId,
        range: ByteRange,
    },
    /// A Source was put back in the Waiting list
    Queued {
        source: SourceId,
        delay_ms: u64,
        reason: String,
    },
    /// A Source was stopped
    Stopped {
        source: SourceId,
        status: SourceStatus,
        reason: String,
    },
    /// A Source was destroyed
    SourceRemoved { source: SourceId },
    /// A stale peer record was folded into another
    PeerMerged { from: PeerId, into: PeerId },
    /// A peer failed too often and all its Sources were stopped
    PeerUnavailable { peer: PeerId },
    /// A peer record was reclaimed
    PeerRetired { peer: PeerId },
    /// A Source is known bad and should be dropped from the download mesh
    MeshRemoval {
        file: FileId,
        addr: SocketAddr,
        reason: String,
    },
    /// Overlap bytes matched what was on disk
    OverlapVerified { source: SourceId, bytes: u64 },
    /// Every byte of a file is present
    FileCompleted { file: FileId },
    /// Hash verification of a file finished
    FileVerified { file: FileId, ok: bool },
    /// A completed file was moved to its destination
    FileMoved { file: FileId },
}

impl TransferEvent {
    /// Source this event is about, if any
    pub fn source(&self) -> Option<SourceId> {
        match self {
            TransferEvent::SourceAdded { source, .. }
            | TransferEvent::StateChanged { source, .. }
            | TransferEvent::AttemptCompleted { source, .. }
            | TransferEvent::Queued { source, .. }
            | TransferEvent::Stopped { source, .. }
            | TransferEvent::SourceRemoved { source }
            | TransferEvent::OverlapVerified { source, .. } => Some(*source),
            _ => None,
        }
    }
}
