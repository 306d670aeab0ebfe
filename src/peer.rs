//! Remote peer records
//!
//! A `Peer` holds everything we know about one remote servent and the three
//! lists of Sources that target it. The lists are the ground truth for the
//! per-peer counters.

use crate::push::PushProxyList;
use crate::source::ListMarker;
use crate::types::{PeerId, PeerIdentity, SourceId, Timestamp};
use bitflags::bitflags;

bitflags! {
    /// Behavioural flags learnt about a peer
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct PeerAttributes: u8 {
        /// Peer refused us in a hostile way
        const BANNING = 0x01;
        /// Do not reuse connections to this peer
        const NO_KEEPALIVE = 0x02;
        /// Peer is firewalled; reach it by push only
        const PUSH_NEEDED = 0x04;
        /// Push requests to this peer went unanswered
        const PUSH_IGNORED = 0x08;
        /// Send the smallest request headers we can
        const MINIMAL_REQUESTS = 0x10;
        /// Too many consecutive failures
        const UNAVAILABLE = 0x20;
    }
}

/// One remote peer
#[derive(Debug)]
pub struct Peer {
    pub(crate) id: PeerId,
    pub(crate) identity: PeerIdentity,
    /// Earliest time any Source on this peer may be attempted
    pub(crate) retry_after: Timestamp,
    /// Key under which the peer currently sits in the RetryIndex
    pub(crate) indexed_at: Option<Timestamp>,
    /// No Source on this peer is attempted before this time
    pub(crate) hold_until: Timestamp,
    pub(crate) last_request: Option<Timestamp>,
    pub(crate) push_proxies: PushProxyList,
    pub(crate) attributes: PeerAttributes,
    pub(crate) hostname: Option<String>,
    pub(crate) last_lookup: Option<Timestamp>,
    /// Consecutive failures; reset by any successful reply
    pub(crate) failures: u32,
    pub(crate) server: Option<String>,
    pub(crate) waiting: Vec<SourceId>,
    pub(crate) running: Vec<SourceId>,
    pub(crate) stopped: Vec<SourceId>,
    pub(crate) refcount: usize,
    /// Whether this peer owns its address key in the secondary index
    pub(crate) addr_indexed: bool,
}

impl Peer {
    pub(crate) fn new(id: PeerId, identity: PeerIdentity) -> Self {
        Self {
            id,
            identity,
            retry_after: Timestamp::ZERO,
            indexed_at: None,
            hold_until: Timestamp::ZERO,
            last_request: None,
            push_proxies: PushProxyList::default(),
            attributes: PeerAttributes::empty(),
            hostname: None,
            last_lookup: None,
            failures: 0,
            server: None,
            waiting: Vec::new(),
            running: Vec::new(),
            stopped: Vec::new(),
            refcount: 0,
            addr_indexed: false,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn retry_after(&self) -> Timestamp {
        self.retry_after
    }

    pub fn hold_until(&self) -> Timestamp {
        self.hold_until
    }

    pub fn attributes(&self) -> PeerAttributes {
        self.attributes
    }

    pub fn has(&self, attr: PeerAttributes) -> bool {
        self.attributes.contains(attr)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn push_proxies(&self) -> &PushProxyList {
        &self.push_proxies
    }

    pub fn refcount(&self) -> usize {
        self.refcount
    }

    pub fn waiting(&self) -> &[SourceId] {
        &self.waiting
    }

    pub fn running(&self) -> &[SourceId] {
        &self.running
    }

    pub fn stopped(&self) -> &[SourceId] {
        &self.stopped
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn stopped_count(&self) -> usize {
        self.stopped.len()
    }

    /// Whether the peer can only be reached through a push
    pub fn needs_push(&self) -> bool {
        self.has(PeerAttributes::PUSH_NEEDED)
    }

    pub(crate) fn list(&self, marker: ListMarker) -> Option<&Vec<SourceId>> {
        match marker {
            ListMarker::Waiting => Some(&self.waiting),
            ListMarker::Running => Some(&self.running),
            ListMarker::Stopped => Some(&self.stopped),
            ListMarker::None => None,
        }
    }

    pub(crate) fn list_mut(&mut self, marker: ListMarker) -> Option<&mut Vec<SourceId>> {
        match marker {
            ListMarker::Waiting => Some(&mut self.waiting),
            ListMarker::Running => Some(&mut self.running),
            ListMarker::Stopped => Some(&mut self.stopped),
            ListMarker::None => None,
        }
    }

    /// Append a Source to one of the lists
    pub(crate) fn attach(&mut self, source: SourceId, marker: ListMarker) {
        if let Some(list) = self.list_mut(marker) {
            debug_assert!(!list.contains(&source), "{} listed twice", source);
            list.push(source);
        }
    }

    /// Remove a Source from one of the lists, returning whether it was there
    pub(crate) fn detach(&mut self, source: SourceId, marker: ListMarker) -> bool {
        match self.list_mut(marker) {
            Some(list) => match list.iter().position(|s| *s == source) {
                Some(pos) => {
                    list.remove(pos);
                    true
                }
                None => false,
            },
            None => true,
        }
    }

    /// Every Source on this peer, in Waiting, Running, Stopped order
    pub fn all_sources(&self) -> Vec<SourceId> {
        self.waiting
            .iter()
            .chain(self.running.iter())
            .chain(self.stopped.iter())
            .copied()
            .collect()
    }
}
