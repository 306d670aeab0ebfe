//! Periodic scheduling pass
//!
//! Each tick first expires Sources that sat too long in a state, then walks
//! the retry index promoting at most one due Source per peer, within the
//! global and per-peer running caps.

use super::TransferManager;
use crate::chunk::{Allocation, ChunkRequest};
use crate::error::{NetworkErrorKind, ProtocolErrorKind, TransferError};
use crate::events::TransferEvent;
use crate::source::{ListMarker, Source, SourceState, SourceStatus};
use crate::types::{PeerId, SourceId};
use std::collections::HashSet;
use std::time::Duration;

enum Expiry {
    Rerequest,
    Connect,
    Push,
    Failed(NetworkErrorKind, &'static str),
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sources promoted to Running
    pub promoted: Vec<SourceId>,
    /// Sources expired by a state timeout
    pub timed_out: Vec<SourceId>,
    /// Peers reclaimed
    pub retired: Vec<PeerId>,
}

impl TransferManager {
    /// Run one scheduling pass
    pub fn tick(&mut self) -> TickReport {
        self.refresh_now();
        let mut report = TickReport::default();

        for peer in self.registry.reclaim_orphans() {
            self.emit(TransferEvent::PeerRetired { peer });
            report.retired.push(peer);
        }

        report.timed_out = self.expire_timeouts();
        report.promoted = self.schedule();

        if !report.promoted.is_empty() {
            tracing::debug!(
                "Tick promoted {} sources, {} running",
                report.promoted.len(),
                self.running
            );
        }
        report
    }

    fn expire_timeouts(&mut self) -> Vec<SourceId> {
        let now = self.now;
        let mut running: Vec<SourceId> = self
            .sources
            .values()
            .filter(|s| s.list == ListMarker::Running)
            .map(|s| s.id)
            .collect();
        running.sort();

        let mut expired = Vec::new();
        for id in running {
            let Some(source) = self.sources.get(&id) else {
                continue;
            };
            let idle = now.saturating_since(source.last_activity);

            let expiry = match &source.state {
                SourceState::ActiveQueued { retry_at, .. } if now >= *retry_at => Expiry::Rerequest,
                SourceState::Connecting { .. } if idle >= self.config.connect_timeout() => {
                    Expiry::Connect
                }
                SourceState::PushSent { .. } if idle >= self.config.push_timeout() => Expiry::Push,
                SourceState::Headers { .. } if idle >= self.config.header_timeout() => {
                    Expiry::Failed(NetworkErrorKind::HeaderTimeout, "No response headers")
                }
                SourceState::Receiving { .. } | SourceState::Sinking { .. }
                    if idle >= self.config.data_timeout() =>
                {
                    Expiry::Failed(NetworkErrorKind::DataStall, "Data stalled")
                }
                _ => continue,
            };

            match expiry {
                Expiry::Rerequest => self.rerequest_active(id),
                Expiry::Connect => {
                    expired.push(id);
                    tracing::debug!("{} connect timed out", id);
                    if !self.try_push(id) {
                        self.fail_transient(
                            id,
                            &TransferError::network(
                                NetworkErrorKind::ConnectTimeout,
                                "Connect timed out",
                            ),
                        );
                    }
                }
                Expiry::Push => {
                    expired.push(id);
                    self.push_timed_out(id);
                }
                Expiry::Failed(kind, message) => {
                    expired.push(id);
                    tracing::debug!("{} timed out: {}", id, message);
                    self.fail_transient(id, &TransferError::network(kind, message));
                }
            }
        }
        expired
    }

    /// Walk the retry index and promote due Sources
    fn schedule(&mut self) -> Vec<SourceId> {
        let now = self.now;
        let mut promoted = Vec::new();
        let mut visited: HashSet<PeerId> = HashSet::new();
        let buckets = self.registry.retry_index().bucket_count();

        'buckets: for bucket in 0..buckets {
            'restart: loop {
                let mut cursor = self.registry.retry_index().cursor(bucket);
                loop {
                    if self.running >= self.config.max_running {
                        break 'buckets;
                    }
                    if !self.collab.connector.can_connect() {
                        tracing::trace!("Connector refuses new connections");
                        break 'buckets;
                    }

                    let peer = match self.registry.retry_index().next_due(&mut cursor, now) {
                        Err(()) => continue 'restart,
                        Ok(None) => continue 'buckets,
                        Ok(Some((_, peer))) => peer,
                    };
                    if !visited.insert(peer) {
                        continue;
                    }

                    if let Some(id) = self.pick_source(peer) {
                        promoted.push(id);
                        self.promote(id);
                    }
                }
            }
        }
        promoted
    }

    /// Earliest-queued due Waiting Source of `peer` allowed to run now
    fn pick_source(&self, peer: PeerId) -> Option<SourceId> {
        let p = self.registry.get(peer)?;
        if p.running.len() >= self.config.max_running_per_peer {
            return None;
        }

        let mut candidates: Vec<_> = p
            .waiting
            .iter()
            .filter_map(|id| self.sources.get(id))
            .filter(|s| s.retry_after <= self.now && self.may_start(s))
            .collect();
        candidates.sort_by_key(|s| s.queue_seq);
        candidates.first().map(|s| s.id)
    }

    /// Whether a Waiting Source may join the Running list now, retry time
    /// aside: not suspended, within both running caps, and not a second
    /// Source for a file that is not swarmed
    pub(crate) fn may_start(&self, source: &Source) -> bool {
        if source.flags.suspended || self.running >= self.config.max_running {
            return false;
        }
        let peer_full = self
            .registry
            .get(source.peer)
            .map(|p| p.running.len() >= self.config.max_running_per_peer)
            .unwrap_or(true);
        if peer_full {
            return false;
        }
        let swarming = self.files.get(&source.file).map(|f| f.swarming).unwrap_or(false);
        swarming || !self.file_has_running(source.file, source.id)
    }

    /// Move a Waiting Source into its peer's Running list and start it
    pub(crate) fn promote(&mut self, id: SourceId) {
        let Some(peer_id) = self.sources.get(&id).map(|s| s.peer) else {
            return;
        };
        if let Some(peer) = self.registry.get_mut(peer_id) {
            peer.last_request = Some(self.now);
        }
        if let Some(source) = self.sources.get_mut(&id) {
            source.new_attempt();
        }
        self.transition(id, SourceState::Waiting);
        tracing::debug!("Promoted {} on {}", id, peer_id);

        if self.allocate_range(id) {
            self.connect(id);
        }
    }

    /// Pick the next range for a Source. Returns false when the Source was
    /// queued or stopped instead.
    pub(crate) fn allocate_range(&mut self, id: SourceId) -> bool {
        let Some(source) = self.sources.get(&id) else {
            return false;
        };
        let file_id = source.file;
        let busy = self.busy_ranges(file_id, id);
        let Some(file) = self.files.get(&file_id) else {
            return false;
        };

        let allocation = self.allocator.allocate(
            file.assembly.as_ref(),
            &ChunkRequest {
                swarming: file.swarming,
                availability: source.availability.as_ref(),
                busy: &busy,
            },
        );
        let swarming = file.swarming;

        match allocation {
            Allocation::Range {
                start,
                end,
                overlap,
            } => {
                if let Some(source) = self.sources.get_mut(&id) {
                    source.skip = start;
                    source.overlap = overlap;
                    source.overlap_pending = overlap;
                    source.pos = start - overlap;
                    source.range_end = end;
                    source.flags.swarm_chunk = swarming;
                }
                tracing::trace!("{} allocated {}-{} (overlap {})", id, start, end, overlap);
                true
            }
            Allocation::Busy => {
                let delay = Duration::from_secs(self.config.retry.chunks_busy_delay);
                self.requeue(id, delay, "All chunks busy", SourceState::Queued);
                false
            }
            Allocation::Done => {
                let reason = TransferError::protocol(ProtocolErrorKind::NothingLeft, "Nothing left to request")
                    .to_string();
                tracing::debug!("{} has nothing left to fetch from {}", file_id, id);
                let _ = self.stop_with(id, SourceState::Error { reason: reason.clone() }, &reason);
                self.stop_queued_siblings(file_id, &reason);
                false
            }
        }
    }

    /// Stop the Waiting Sources of `file`
    fn stop_queued_siblings(&mut self, file: crate::types::FileId, reason: &str) {
        let waiting: Vec<SourceId> = self
            .files
            .get(&file)
            .map(|f| {
                f.sources
                    .iter()
                    .copied()
                    .filter(|s| {
                        self.sources
                            .get(s)
                            .map(|src| src.list == ListMarker::Waiting)
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        for id in waiting {
            let _ = self.stop_with(id, SourceState::Aborted, reason);
        }
    }

    /// Reach the peer: directly, by name, or through a push
    pub(crate) fn connect(&mut self, id: SourceId) {
        let Some(peer_id) = self.sources.get(&id).map(|s| s.peer) else {
            return;
        };
        let Some(peer) = self.registry.get(peer_id) else {
            return;
        };

        if peer.needs_push() {
            if !self.try_push(id) {
                self.fail_transient(
                    id,
                    &TransferError::network(NetworkErrorKind::Unreachable, "Firewalled and no push route"),
                );
            }
            return;
        }

        let addr = peer.identity.addr;
        let lookup_due = peer.hostname.is_some()
            && peer
                .last_lookup
                .map(|t| {
                    self.now.saturating_since(t)
                        >= Duration::from_secs(self.config.name_lookup_interval_secs)
                })
                .unwrap_or(true);

        let attempt = if lookup_due {
            let host = peer.hostname.clone().unwrap_or_default();
            if let Some(peer) = self.registry.get_mut(peer_id) {
                peer.last_lookup = Some(self.now);
            }
            tracing::debug!("{} connecting to {}:{} by name", id, host, addr.port());
            self.collab.connector.connect_by_name(&host, addr.port())
        } else {
            tracing::debug!("{} connecting to {}", id, addr);
            self.collab.connector.connect(addr)
        };

        match attempt {
            Ok(conn) => {
                self.connections.insert(conn, id);
                self.transition(id, SourceState::Connecting { conn });
            }
            Err(e) => {
                tracing::debug!("{} connect to {} failed: {}", id, addr, e);
                if !self.try_push(id) {
                    self.handle_failure(id, e);
                }
            }
        }
    }

    /// An actively queued Source asks again over its open connection
    fn rerequest_active(&mut self, id: SourceId) {
        if self.sources.get(&id).map(|s| s.status()) != Some(SourceStatus::ActiveQueued) {
            return;
        }
        let Some(SourceState::ActiveQueued { socket, .. }) = self.transition(id, SourceState::Waiting)
        else {
            return;
        };
        if let Some(source) = self.sources.get_mut(&id) {
            source.new_attempt();
        }
        if self.allocate_range(id) {
            self.issue_request(id, socket);
        } else {
            self.close_connection(socket.id);
        }
    }
}
