//! Transport seams
//!
//! The transfer core never touches sockets or header text. It asks a
//! [`Connector`] for connections and a [`HeaderExchange`] to send requests;
//! outcomes come back as calls on the `TransferManager`. This module also
//! holds the request/response descriptions exchanged across those seams and
//! the validation of a served byte range.

use crate::error::{ProtocolErrorKind, Result, TransferError};
use crate::types::{AttemptId, ByteRange, Guid, RangeSet, SourceId};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Handle of a transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// An established connection owned by a Source
#[derive(Debug)]
pub struct Socket {
    pub id: ConnectionId,
    /// Receive buffer; lent to the Source's `Buffers` while receiving
    pub recv: BytesMut,
}

impl Socket {
    pub fn new(id: ConnectionId, recv_capacity: usize) -> Self {
        Self {
            id,
            recv: BytesMut::with_capacity(recv_capacity),
        }
    }
}

/// Opens and closes connections
pub trait Connector: Send {
    /// Start connecting to `addr`. Completion is reported through
    /// `TransferManager::on_connected` or `on_connect_failed`.
    fn connect(&mut self, addr: SocketAddr) -> Result<ConnectionId>;

    /// Resolve `host` and connect to it
    fn connect_by_name(&mut self, host: &str, port: u16) -> Result<ConnectionId>;

    fn close(&mut self, conn: ConnectionId);

    /// Whether new outgoing connections are allowed right now
    fn can_connect(&self) -> bool;
}

/// Sends request headers over an established connection
pub trait HeaderExchange: Send {
    fn send_request(&mut self, conn: ConnectionId, plan: &RequestPlan) -> Result<()>;
}

/// What a Source asks of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPlan {
    pub source: SourceId,
    pub attempt: AttemptId,
    pub file_name: String,
    pub file_index: u32,
    pub guid: Guid,
    /// Content hash to request by, when known
    pub hash: Option<String>,
    /// First byte requested, overlap included
    pub start: u64,
    /// Last byte requested (inclusive)
    pub end: u64,
    /// Bytes before the resume point requested for verification
    pub overlap: u64,
    pub keep_alive: bool,
    /// Send minimal headers (peer dislikes chatter)
    pub minimal: bool,
}

impl RequestPlan {
    /// Requested bytes as a half-open range
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end + 1)
    }
}

/// Remote queue slot announced by a busy peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteQueue {
    pub id: String,
    pub position: u32,
    pub length: u32,
    /// When to ask again
    pub retry_after: Duration,
    /// Whether the peer wants us to keep the connection open
    pub active: bool,
}

/// Served byte range, `bytes start-end/total`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRange {
    pub start: u64,
    /// Inclusive
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn new(start: u64, end: u64, total: Option<u64>) -> Self {
        Self { start, end, total }
    }

    /// Parse `bytes start-end/total` or `bytes start-end/*`
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = header.split_once('/')?;
        let (start, end) = range.split_once('-')?;

        let start = start.trim().parse::<u64>().ok()?;
        let end = end.trim().parse::<u64>().ok()?;
        if end < start {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().ok()?),
        };
        Some(Self { start, end, total })
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end + 1)
    }
}

impl std::fmt::Display for ContentRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.total {
            Some(total) => write!(f, "bytes {}-{}/{}", self.start, self.end, total),
            None => write!(f, "bytes {}-{}/*", self.start, self.end),
        }
    }
}

/// Parsed response headers, as far as the transfer core cares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u16,
    pub reason: String,
    pub content_range: Option<ContentRange>,
    pub content_length: Option<u64>,
    pub server: Option<String>,
    pub retry_after: Option<Duration>,
    /// Ranges the peer has of a file it is still downloading itself
    pub available_ranges: Option<RangeSet>,
    pub queue: Option<RemoteQueue>,
    pub keep_alive: bool,
    pub content_hash: Option<String>,
    /// Address the peer says it is reachable at
    pub node_addr: Option<SocketAddr>,
    pub push_proxies: Vec<SocketAddr>,
}

impl ResponseInfo {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            ..Default::default()
        }
    }

    /// Successful response serving `range`
    pub fn partial(range: ContentRange) -> Self {
        Self {
            content_length: Some(range.end - range.start + 1),
            content_range: Some(range),
            keep_alive: true,
            ..Self::new(206, "Partial Content")
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_available(mut self, ranges: RangeSet) -> Self {
        self.available_ranges = Some(ranges);
        self
    }

    pub fn with_queue(mut self, queue: RemoteQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_push_proxies(mut self, proxies: Vec<SocketAddr>) -> Self {
        self.push_proxies = proxies;
        self
    }

    pub fn with_node_addr(mut self, addr: SocketAddr) -> Self {
        self.node_addr = Some(addr);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Check a served range against the request.
///
/// The served range must start exactly where the request started (overlap
/// included). A swarming file may be served a shorter range than asked for;
/// anything else must end where requested. Returns the accepted range.
pub fn validate_served_range(
    plan: &RequestPlan,
    served: &ContentRange,
    file_size: Option<u64>,
    swarming: bool,
) -> Result<ByteRange> {
    if let (Some(total), Some(size)) = (served.total, file_size) {
        if total != size {
            return Err(TransferError::protocol(
                ProtocolErrorKind::SizeMismatch,
                format!("Served total {} but file is {} bytes", total, size),
            ));
        }
    }

    if served.start != plan.start {
        return Err(TransferError::protocol(
            ProtocolErrorKind::RangeMismatch,
            format!(
                "Requested {}-{}, served {}-{}",
                plan.start, plan.end, served.start, served.end
            ),
        ));
    }

    let shorter_ok = swarming && served.end < plan.end && served.end >= plan.start + plan.overlap;
    if served.end != plan.end && !shorter_ok {
        return Err(TransferError::protocol(
            ProtocolErrorKind::RangeMismatch,
            format!(
                "Requested {}-{}, served {}-{}",
                plan.start, plan.end, served.start, served.end
            ),
        ));
    }

    Ok(served.range())
}
