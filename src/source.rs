//! Download sources
//!
//! A `Source` is one queued or outstanding transfer attempt against one peer
//! for one file. Its state is a sum type: the connection and receive buffers
//! live inside the variants that use them, so moving out of a state is the
//! only way to get at them and they are released exactly once.

use crate::buffers::Buffers;
use crate::push::PushRoute;
use crate::transport::{ConnectionId, Socket};
use crate::types::{AttemptId, FileId, PeerId, RangeSet, SourceId, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which peer list a Source currently sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListMarker {
    Waiting,
    Running,
    Stopped,
    None,
}

/// State of a Source, with the resources each state owns
#[derive(Debug)]
pub enum SourceState {
    /// Waiting list, never failed
    Queued,
    /// Waiting list, backing off after a failure
    TimeoutWait,
    /// Waiting list; the remote queued us and will be asked again later
    PassiveQueued { queue_id: String },
    /// Running list, deciding how to reach the peer
    Waiting,
    /// Direct connect in progress
    Connecting { conn: ConnectionId },
    /// Push sent, waiting for the reverse connection
    PushSent { route: PushRoute },
    /// Request sent, waiting for the response headers
    Headers { socket: Socket },
    /// Receiving body bytes
    Receiving { socket: Socket, buffers: Buffers },
    /// Discarding an unwanted body before re-requesting
    Sinking { socket: Socket, remaining: u64 },
    /// Remotely queued with the connection kept open
    ActiveQueued {
        socket: Socket,
        queue_id: String,
        retry_at: Timestamp,
    },
    Completed,
    Aborted,
    Error { reason: String },
    VerifyWait,
    Verifying,
    Verified,
    MoveWait,
    Moving,
    Done,
    Removed,
}

/// Label of a [`SourceState`], for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceStatus {
    Queued,
    TimeoutWait,
    PassiveQueued,
    Waiting,
    Connecting,
    PushSent,
    Headers,
    Receiving,
    Sinking,
    ActiveQueued,
    Completed,
    Aborted,
    Error,
    VerifyWait,
    Verifying,
    Verified,
    MoveWait,
    Moving,
    Done,
    Removed,
}

impl std::fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl SourceState {
    pub fn status(&self) -> SourceStatus {
        match self {
            SourceState::Queued => SourceStatus::Queued,
            SourceState::TimeoutWait => SourceStatus::TimeoutWait,
            SourceState::PassiveQueued { .. } => SourceStatus::PassiveQueued,
            SourceState::Waiting => SourceStatus::Waiting,
            SourceState::Connecting { .. } => SourceStatus::Connecting,
            SourceState::PushSent { .. } => SourceStatus::PushSent,
            SourceState::Headers { .. } => SourceStatus::Headers,
            SourceState::Receiving { .. } => SourceStatus::Receiving,
            SourceState::Sinking { .. } => SourceStatus::Sinking,
            SourceState::ActiveQueued { .. } => SourceStatus::ActiveQueued,
            SourceState::Completed => SourceStatus::Completed,
            SourceState::Aborted => SourceStatus::Aborted,
            SourceState::Error { .. } => SourceStatus::Error,
            SourceState::VerifyWait => SourceStatus::VerifyWait,
            SourceState::Verifying => SourceStatus::Verifying,
            SourceState::Verified => SourceStatus::Verified,
            SourceState::MoveWait => SourceStatus::MoveWait,
            SourceState::Moving => SourceStatus::Moving,
            SourceState::Done => SourceStatus::Done,
            SourceState::Removed => SourceStatus::Removed,
        }
    }

    /// Connection used by this state, if any
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            SourceState::Connecting { conn } => Some(*conn),
            SourceState::Headers { socket }
            | SourceState::Receiving { socket, .. }
            | SourceState::Sinking { socket, .. }
            | SourceState::ActiveQueued { socket, .. } => Some(socket.id),
            _ => None,
        }
    }
}

impl SourceStatus {
    /// States belonging to the Waiting list
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            SourceStatus::Queued | SourceStatus::TimeoutWait | SourceStatus::PassiveQueued
        )
    }

    /// States belonging to the Running list
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            SourceStatus::Waiting
                | SourceStatus::Connecting
                | SourceStatus::PushSent
                | SourceStatus::Headers
                | SourceStatus::Receiving
                | SourceStatus::Sinking
                | SourceStatus::ActiveQueued
        )
    }

    /// States belonging to the Stopped list
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            SourceStatus::Completed
                | SourceStatus::Aborted
                | SourceStatus::Error
                | SourceStatus::VerifyWait
                | SourceStatus::Verifying
                | SourceStatus::Verified
                | SourceStatus::MoveWait
                | SourceStatus::Moving
                | SourceStatus::Done
        )
    }

    /// List a Source in this state must sit in
    pub fn list(&self) -> ListMarker {
        if self.is_waiting() {
            ListMarker::Waiting
        } else if self.is_running() {
            ListMarker::Running
        } else if self.is_stopped() {
            ListMarker::Stopped
        } else {
            ListMarker::None
        }
    }
}

/// Boolean facts about a Source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFlags {
    /// Current range was picked as a swarm chunk
    pub swarm_chunk: bool,
    /// Temporarily not eligible for scheduling
    pub suspended: bool,
    /// Current connection is kept alive between requests
    pub keep_alive: bool,
    /// A push was tried for the current attempt
    pub push_attempted: bool,
    /// The peer answered at least once
    pub replied: bool,
    /// The peer sent more than the requested range
    pub overflowed: bool,
    /// Do not retry after the next failure
    pub no_retry: bool,
}

/// One transfer attempt against one peer for one file
#[derive(Debug)]
pub struct Source {
    pub(crate) id: SourceId,
    pub(crate) attempt: AttemptId,
    pub(crate) file: FileId,
    pub(crate) file_index: u32,
    pub(crate) peer: PeerId,
    pub(crate) state: SourceState,
    pub(crate) list: ListMarker,

    /// Resume point of the current request
    pub(crate) skip: u64,
    /// Next byte to be written
    pub(crate) pos: u64,
    /// End of the current request (exclusive)
    pub(crate) range_end: u64,
    /// Bytes before `skip` requested for verification
    pub(crate) overlap: u64,
    /// Overlap bytes still to be compared in this attempt
    pub(crate) overlap_pending: u64,

    pub(crate) flags: SourceFlags,
    /// Consecutive failures of this Source
    pub(crate) retries: u32,
    pub(crate) last_delay: Duration,
    pub(crate) last_activity: Timestamp,
    /// When the Source started receiving its current body
    pub(crate) run_start: Option<Timestamp>,
    pub(crate) retry_after: Timestamp,
    /// FIFO order among Waiting Sources
    pub(crate) queue_seq: u64,
    pub(crate) availability: Option<RangeSet>,
    pub(crate) remote_queue: Option<String>,
    /// Body bytes received across all attempts
    pub(crate) received: u64,
    pub(crate) last_reason: Option<String>,
}

impl Source {
    pub(crate) fn new(
        id: SourceId,
        file: FileId,
        file_index: u32,
        peer: PeerId,
        now: Timestamp,
        queue_seq: u64,
    ) -> Self {
        Self {
            id,
            attempt: AttemptId::new(),
            file,
            file_index,
            peer,
            state: SourceState::Queued,
            list: ListMarker::None,
            skip: 0,
            pos: 0,
            range_end: 0,
            overlap: 0,
            overlap_pending: 0,
            flags: SourceFlags::default(),
            retries: 0,
            last_delay: Duration::ZERO,
            last_activity: now,
            run_start: None,
            retry_after: now,
            queue_seq,
            availability: None,
            remote_queue: None,
            received: 0,
            last_reason: None,
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn file_index(&self) -> u32 {
        self.file_index
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn status(&self) -> SourceStatus {
        self.state.status()
    }

    pub fn state(&self) -> &SourceState {
        &self.state
    }

    pub fn list(&self) -> ListMarker {
        self.list
    }

    pub fn flags(&self) -> SourceFlags {
        self.flags
    }

    pub fn skip(&self) -> u64 {
        self.skip
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn range_end(&self) -> u64 {
        self.range_end
    }

    pub fn overlap(&self) -> u64 {
        self.overlap
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn retry_after(&self) -> Timestamp {
        self.retry_after
    }

    pub fn availability(&self) -> Option<&RangeSet> {
        self.availability.as_ref()
    }

    pub fn remote_queue(&self) -> Option<&str> {
        self.remote_queue.as_deref()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Reason given with the last stop or queue
    pub fn last_reason(&self) -> Option<&str> {
        self.last_reason.as_deref()
    }

    /// Bytes left in the current request
    pub fn range_remaining(&self) -> u64 {
        self.range_end.saturating_sub(self.pos)
    }

    /// Replace the state, returning the old one with whatever it owned
    pub(crate) fn take_state(&mut self, next: SourceState) -> SourceState {
        std::mem::replace(&mut self.state, next)
    }

    /// Start a fresh logical request on this Source
    pub(crate) fn new_attempt(&mut self) -> AttemptId {
        self.attempt = AttemptId::new();
        self.flags.push_attempted = false;
        self.flags.overflowed = false;
        self.attempt
    }
}
