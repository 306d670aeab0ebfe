//! Peer registry
//!
//! Owns every `Peer` record, the exact-identity index, the secondary
//! address index and the RetryIndex. Peers are created on first reference
//! and reclaimed only once nothing points at them any more; reclamation is
//! deferred to the next tick so a peer dropped and re-referenced within the
//! same pass keeps its history.

use crate::error::{Result, TransferError};
use crate::peer::{Peer, PeerAttributes};
use crate::retry_index::RetryIndex;
use crate::types::{Guid, PeerId, PeerIdentity, Timestamp};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// All known peers and their indices
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
    next_id: u64,
    primary: HashMap<PeerIdentity, PeerId>,
    by_addr: HashMap<SocketAddr, PeerId>,
    retry_index: RetryIndex,
    /// Peers whose refcount dropped to zero, reclaimed on the next tick
    orphans: Vec<PeerId>,
    request_spacing: Duration,
}

impl PeerRegistry {
    pub fn new(buckets: usize, request_spacing: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            next_id: 1,
            primary: HashMap::new(),
            by_addr: HashMap::new(),
            retry_index: RetryIndex::new(buckets),
            orphans: Vec::new(),
            request_spacing,
        }
    }

    /// Find the peer for `identity`, creating it if needed.
    ///
    /// An identity with a blank GUID resolves to whichever peer already owns
    /// its address.
    pub fn get_or_create(&mut self, identity: PeerIdentity) -> PeerId {
        if let Some(id) = self.find(&identity) {
            return id;
        }
        if identity.guid.is_blank() {
            if let Some(id) = self.by_addr.get(&identity.addr) {
                return *id;
            }
        }
        self.create(identity)
    }

    /// Create a fresh record even if one exists at the same address
    pub(crate) fn create(&mut self, identity: PeerIdentity) -> PeerId {
        if let Some(id) = self.primary.get(&identity) {
            return *id;
        }
        let id = PeerId(self.next_id);
        self.next_id += 1;

        let mut peer = Peer::new(id, identity);
        if !self.by_addr.contains_key(&identity.addr) {
            self.by_addr.insert(identity.addr, id);
            peer.addr_indexed = true;
        }
        self.primary.insert(identity, id);
        self.peers.insert(id, peer);
        // Unreferenced until a Source points at it
        self.orphans.push(id);

        tracing::debug!("New peer {} for {}", id, identity);
        id
    }

    pub fn find(&self, identity: &PeerIdentity) -> Option<PeerId> {
        self.primary.get(identity).copied()
    }

    /// Peer owning `addr` in the secondary index
    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<PeerId> {
        self.by_addr.get(addr).copied()
    }

    /// Every peer announcing `guid`
    pub fn find_by_guid(&self, guid: &Guid) -> Vec<PeerId> {
        if guid.is_blank() {
            return Vec::new();
        }
        let mut found: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.identity.guid == *guid)
            .map(|p| p.id)
            .collect();
        found.sort();
        found
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub(crate) fn expect_mut(&mut self, id: PeerId) -> Result<&mut Peer> {
        self.peers
            .get_mut(&id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn retry_index(&self) -> &RetryIndex {
        &self.retry_index
    }

    /// One more Source points at this peer
    pub(crate) fn acquire(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.refcount += 1;
        }
    }

    /// One Source less points at this peer
    pub(crate) fn release(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            debug_assert!(peer.refcount > 0, "{} released below zero", id);
            peer.refcount = peer.refcount.saturating_sub(1);
            if peer.refcount == 0 {
                self.orphans.push(id);
            }
        }
    }

    /// Recompute a peer's `retry_after` and reposition it in the RetryIndex.
    ///
    /// `earliest_waiting` is the smallest `retry_after` among the peer's
    /// Waiting Sources, or `None` when it has none; such peers are not
    /// indexed.
    pub(crate) fn reindex(&mut self, id: PeerId, earliest_waiting: Option<Timestamp>) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };

        if let Some(at) = peer.indexed_at.take() {
            self.retry_index.remove(at, id);
        }

        let spacing_floor = peer
            .last_request
            .map(|t| t + self.request_spacing)
            .unwrap_or(Timestamp::ZERO);

        match earliest_waiting {
            Some(due) => {
                let retry_after = due.max(peer.hold_until).max(spacing_floor);
                peer.retry_after = retry_after;
                peer.indexed_at = Some(retry_after);
                self.retry_index.insert(retry_after, id);
            }
            None => {
                peer.retry_after = peer.hold_until.max(spacing_floor);
            }
        }
    }

    /// Flip `PUSH_NEEDED`, keeping the address index limited to directly
    /// reachable peers
    pub(crate) fn set_push_needed(&mut self, id: PeerId, needed: bool) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.attributes.set(PeerAttributes::PUSH_NEEDED, needed);
        let addr = peer.identity.addr;

        if needed {
            if peer.addr_indexed {
                peer.addr_indexed = false;
                self.by_addr.remove(&addr);
            }
        } else if !peer.addr_indexed && !self.by_addr.contains_key(&addr) {
            peer.addr_indexed = true;
            self.by_addr.insert(addr, id);
        }
    }

    /// Make `id` the owner of its address in the secondary index
    pub(crate) fn claim_addr(&mut self, id: PeerId) {
        let Some(addr) = self.peers.get(&id).map(|p| p.identity.addr) else {
            return;
        };
        if let Some(previous) = self.by_addr.insert(addr, id) {
            if previous != id {
                if let Some(p) = self.peers.get_mut(&previous) {
                    p.addr_indexed = false;
                }
            }
        }
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.addr_indexed = true;
            peer.attributes.remove(PeerAttributes::PUSH_NEEDED);
        }
    }

    /// Remove an unreferenced peer from every index
    pub fn retire(&mut self, id: PeerId) -> Result<Peer> {
        let peer = self
            .peers
            .get(&id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;

        if peer.refcount != 0 {
            return Err(TransferError::InvalidState {
                action: "retire peer",
                current_state: format!("{} still referenced {} times", id, peer.refcount),
            });
        }

        let mut peer = self
            .peers
            .remove(&id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;

        if let Some(at) = peer.indexed_at.take() {
            self.retry_index.remove(at, id);
        }
        if self.primary.get(&peer.identity) == Some(&id) {
            self.primary.remove(&peer.identity);
        }
        if self.by_addr.get(&peer.identity.addr) == Some(&id) {
            self.by_addr.remove(&peer.identity.addr);
        }

        tracing::debug!("Retired {} ({})", id, peer.identity);
        Ok(peer)
    }

    /// Retire every peer still unreferenced since it was orphaned.
    /// Returns the retired ids.
    pub(crate) fn reclaim_orphans(&mut self) -> Vec<PeerId> {
        let mut orphans = std::mem::take(&mut self.orphans);
        orphans.sort();
        orphans.dedup();

        let mut retired = Vec::new();
        for id in orphans {
            let unreferenced = self.peers.get(&id).map(|p| p.refcount == 0);
            if unreferenced == Some(true) && self.retire(id).is_ok() {
                retired.push(id);
            }
        }
        retired
    }

    /// Whether a peer is scheduled for reclamation
    pub fn is_orphaned(&self, id: PeerId) -> bool {
        self.orphans.contains(&id)
            && self.peers.get(&id).map(|p| p.refcount == 0).unwrap_or(false)
    }
}
