//! Push fallback and reverse-connection correlation

use super::TransferManager;
use crate::error::{NetworkErrorKind, TransferError};
use crate::peer::PeerAttributes;
use crate::push::{Giv, PushRoute};
use crate::source::{SourceState, SourceStatus};
use crate::transport::{ConnectionId, Socket};
use crate::types::{PeerId, SourceId, Timestamp};
use std::net::SocketAddr;

/// Ranking of a Source as the target of an incoming GIV; lower is better
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct GivRank {
    not_expecting: bool,
    index_differs: bool,
    retry_after: Timestamp,
    queue_seq: u64,
}

impl TransferManager {
    /// Ask the peer to connect back to us: through its push-proxies first,
    /// then routed over the overlay. Returns false if no push went out.
    pub(crate) fn try_push(&mut self, id: SourceId) -> bool {
        let Some((peer_id, file_index, attempted)) = self
            .sources
            .get(&id)
            .map(|s| (s.peer, s.file_index, s.flags.push_attempted))
        else {
            return false;
        };
        let Some(guid) = self.registry.get(peer_id).map(|p| p.identity.guid) else {
            return false;
        };
        if guid.is_blank() {
            tracing::debug!("{} cannot push to {} without a GUID", id, peer_id);
            return false;
        }
        let port = self.config.listen_port;

        while let Some(proxy) = self.registry.get(peer_id).and_then(|p| p.push_proxies.current()) {
            match self.collab.push.request_via_proxy(proxy, &guid, file_index, port) {
                Ok(()) => {
                    tracing::debug!("{} pushing via proxy {}", id, proxy);
                    self.enter_push_sent(id, PushRoute::Proxy(proxy));
                    return true;
                }
                Err(e) => {
                    tracing::debug!("Push-proxy {} for {} failed: {}", proxy, peer_id, e);
                    if let Some(peer) = self.registry.get_mut(peer_id) {
                        peer.push_proxies.report_failure(proxy);
                    }
                }
            }
        }

        let ignored = self
            .registry
            .get(peer_id)
            .map(|p| p.has(PeerAttributes::PUSH_IGNORED))
            .unwrap_or(false);
        if attempted || ignored {
            return false;
        }
        if self.collab.push.route_towards(&guid).is_empty() {
            tracing::debug!("No route towards {} for {}", guid, id);
            return false;
        }
        if !self.collab.push.send_push(&guid, file_index, port) {
            return false;
        }

        tracing::debug!("{} sent routed push to {}", id, guid);
        if let Some(source) = self.sources.get_mut(&id) {
            source.flags.push_attempted = true;
        }
        self.enter_push_sent(id, PushRoute::Routed);
        true
    }

    fn enter_push_sent(&mut self, id: SourceId, route: PushRoute) {
        if let Some(old) = self.transition(id, SourceState::PushSent { route }) {
            self.dispose(id, old);
        }
        if let Some(source) = self.sources.get_mut(&id) {
            source.last_activity = self.now;
        }
    }

    /// No reverse connection arrived in time
    pub(crate) fn push_timed_out(&mut self, id: SourceId) {
        let Some(SourceState::PushSent { route }) = self.sources.get(&id).map(|s| &s.state) else {
            return;
        };
        let route = *route;
        let Some(peer_id) = self.sources.get(&id).map(|s| s.peer) else {
            return;
        };

        match route {
            PushRoute::Proxy(proxy) => {
                if let Some(peer) = self.registry.get_mut(peer_id) {
                    peer.push_proxies.report_failure(proxy);
                }
            }
            PushRoute::Routed => {
                if let Some(peer) = self.registry.get_mut(peer_id) {
                    peer.attributes.insert(PeerAttributes::PUSH_IGNORED);
                }
            }
        }
        tracing::debug!("{} push via {} timed out", id, route);

        if !self.try_push(id) {
            self.fail_transient(
                id,
                &TransferError::network(NetworkErrorKind::PushTimeout, "No reverse connection"),
            );
        }
    }

    /// Outcome of a push relayed through a proxy
    pub fn on_proxy_result(&mut self, id: SourceId, proxy: SocketAddr, ok: bool) {
        self.refresh_now();
        let pending = matches!(
            self.sources.get(&id).map(|s| &s.state),
            Some(SourceState::PushSent { route: PushRoute::Proxy(p) }) if *p == proxy
        );
        if ok || !pending {
            return;
        }
        if let Some(peer) = self.sources.get(&id).map(|s| s.peer) {
            if let Some(peer) = self.registry.get_mut(peer) {
                peer.push_proxies.report_failure(proxy);
            }
        }
        if !self.try_push(id) {
            self.fail_transient(
                id,
                &TransferError::network(NetworkErrorKind::Unreachable, "Every push route failed"),
            );
        }
    }

    /// A peer connected back announcing itself with a GIV. The connection
    /// is handed to the best matching Source, or closed when nothing
    /// matches. A waiting Source only takes it when the scheduler would
    /// let it start.
    pub fn on_giv(&mut self, giv: Giv, conn: ConnectionId) -> Option<SourceId> {
        self.refresh_now();

        let mut peers = self.registry.find_by_guid(&giv.guid);
        if peers.is_empty() {
            peers = self
                .registry
                .iter()
                .filter(|p| p.identity.addr.ip() == giv.addr.ip())
                .map(|p| p.id)
                .collect();
            peers.sort();
        }

        let mut best: Option<(GivRank, SourceId, PeerId)> = None;
        let mut matching_peers = 0;
        let mut declined = 0;
        for peer_id in &peers {
            let Some(peer) = self.registry.get(*peer_id) else {
                continue;
            };
            let mut matched = false;
            for id in peer.running.iter().chain(peer.waiting.iter()) {
                let Some(source) = self.sources.get(id) else {
                    continue;
                };
                let expecting = source.status() == SourceStatus::PushSent;
                if !expecting && !source.status().is_waiting() {
                    continue;
                }
                if !expecting && !self.may_start(source) {
                    declined += 1;
                    continue;
                }
                matched = true;
                let rank = GivRank {
                    not_expecting: !expecting,
                    index_differs: source.file_index != giv.file_index,
                    retry_after: source.retry_after,
                    queue_seq: source.queue_seq,
                };
                if best.as_ref().map(|(r, _, _)| rank < *r).unwrap_or(true) {
                    best = Some((rank, *id, *peer_id));
                }
            }
            if matched {
                matching_peers += 1;
            }
        }

        if matching_peers > 1 {
            tracing::warn!(
                "GIV from {} for {} matches {} peers, taking the best",
                giv.addr,
                giv.guid,
                matching_peers
            );
        }
        let Some((_, id, peer_id)) = best else {
            if declined > 0 {
                tracing::debug!(
                    "GIV from {} for {}: {} waiting sources may not start, closing",
                    giv.addr,
                    giv.guid,
                    declined
                );
            } else {
                tracing::debug!("Unexpected GIV from {} for {}, closing", giv.addr, giv.guid);
            }
            self.collab.connector.close(conn);
            return None;
        };

        let id = match self.follow_giv_address(id, peer_id, &giv) {
            Some(id) => id,
            None => {
                self.collab.connector.close(conn);
                return None;
            }
        };

        if let Some(peer) = self.sources.get(&id).map(|s| s.peer) {
            if let Some(peer) = self.registry.get_mut(peer) {
                peer.attributes.remove(PeerAttributes::PUSH_IGNORED);
            }
        }

        let waiting = self.sources.get(&id).map(|s| s.status().is_waiting()).unwrap_or(false);
        if waiting && !self.sources.get(&id).map(|s| self.may_start(s)).unwrap_or(false) {
            tracing::debug!("GIV from {} matched {}, which may not start now", giv.addr, id);
            self.collab.connector.close(conn);
            return None;
        }

        if waiting {
            tracing::debug!("GIV promotes waiting {}", id);
            if let Some(peer) = self.sources.get(&id).map(|s| s.peer) {
                if let Some(peer) = self.registry.get_mut(peer) {
                    peer.last_request = Some(self.now);
                }
            }
            if let Some(source) = self.sources.get_mut(&id) {
                source.new_attempt();
            }
            self.transition(id, SourceState::Waiting);
            if !self.allocate_range(id) {
                self.collab.connector.close(conn);
                return None;
            }
        } else {
            self.transition(id, SourceState::Waiting);
        }

        tracing::debug!("GIV from {} matched {}", giv.addr, id);
        let socket = Socket::new(conn, self.config.buffers.chunk_size);
        self.issue_request(id, socket);
        Some(id)
    }

    /// When the GIV came from another IP, fold the peer into the record for
    /// its new address. Returns the Source to use afterwards.
    fn follow_giv_address(&mut self, id: SourceId, peer_id: PeerId, giv: &Giv) -> Option<SourceId> {
        let identity = *self.registry.get(peer_id)?.identity();
        if identity.guid.is_blank() || identity.addr.ip() == giv.addr.ip() {
            return Some(id);
        }
        let (file, index) = self.sources.get(&id).map(|s| (s.file, s.file_index))?;

        let new_addr = SocketAddr::new(giv.addr.ip(), identity.addr.port());
        match self.merge_on_address_change(peer_id, new_addr) {
            Ok(canonical) => {
                if self.sources.contains_key(&id) {
                    Some(id)
                } else {
                    self.registry
                        .get(canonical)?
                        .all_sources()
                        .into_iter()
                        .find(|s| {
                            self.sources
                                .get(s)
                                .map(|src| {
                                    src.file == file
                                        && src.file_index == index
                                        && (src.status().is_waiting()
                                            || src.status() == SourceStatus::PushSent)
                                })
                                .unwrap_or(false)
                        })
                }
            }
            Err(e) => {
                tracing::warn!("Cannot follow {} to {}: {}", peer_id, new_addr, e);
                Some(id)
            }
        }
    }
}
