//! Connection setup, requests and response handling
//!
//! Also home of the failure taxonomy: every error a Source runs into ends
//! up in [`TransferManager::handle_failure`], which decides between backing
//! off, holding the peer, or giving up on the Source.

use super::TransferManager;
use crate::buffers::Buffers;
use crate::error::{FailureClass, NetworkErrorKind, ProtocolErrorKind, Result, TransferError};
use crate::events::TransferEvent;
use crate::peer::PeerAttributes;
use crate::source::{ListMarker, SourceState, SourceStatus};
use crate::transport::{validate_served_range, ConnectionId, ContentRange, RequestPlan, ResponseInfo, Socket};
use crate::types::{ByteRange, FileId, PeerId, SourceId};
use std::time::Duration;

impl TransferManager {
    /// A connection started by the Connector is established
    pub fn on_connected(&mut self, conn: ConnectionId) {
        self.refresh_now();
        let Some(&id) = self.connections.get(&conn) else {
            tracing::debug!("Connection {} for no source, closing", conn);
            self.collab.connector.close(conn);
            return;
        };
        match self.sources.get(&id).map(|s| &s.state) {
            Some(SourceState::Connecting { conn: expected }) if *expected == conn => {}
            _ => {
                tracing::debug!("Stale connection {} for {}", conn, id);
                self.close_connection(conn);
                return;
            }
        }

        if let Some(peer) = self.sources.get(&id).map(|s| s.peer) {
            if let Some(peer) = self.registry.get_mut(peer) {
                peer.attributes.remove(PeerAttributes::PUSH_NEEDED);
            }
        }
        // The socket now owns the connection
        self.transition(id, SourceState::Waiting);
        let socket = Socket::new(conn, self.config.buffers.chunk_size);
        self.issue_request(id, socket);
    }

    /// A connection started by the Connector could not be established
    pub fn on_connect_failed(&mut self, conn: ConnectionId, error: TransferError) {
        self.refresh_now();
        let Some(id) = self.connections.remove(&conn) else {
            return;
        };
        if !matches!(
            self.sources.get(&id).map(|s| &s.state),
            Some(SourceState::Connecting { conn: expected }) if *expected == conn
        ) {
            return;
        }
        tracing::debug!("{} connect failed: {}", id, error);
        if !self.try_push(id) {
            self.handle_failure(id, error);
        }
    }

    /// Build the request for a Source's current range
    pub(crate) fn request_plan(&self, id: SourceId) -> Option<RequestPlan> {
        let source = self.sources.get(&id)?;
        let file = self.files.get(&source.file)?;
        let peer = self.registry.get(source.peer)?;
        let end = if source.range_end == u64::MAX {
            u64::MAX
        } else {
            source.range_end.saturating_sub(1)
        };
        Some(RequestPlan {
            source: id,
            attempt: source.attempt,
            file_name: file.name.clone(),
            file_index: source.file_index,
            guid: peer.identity.guid,
            hash: file.hash.clone(),
            start: source.pos,
            end,
            overlap: source.overlap,
            keep_alive: !peer.has(PeerAttributes::NO_KEEPALIVE),
            minimal: peer.has(PeerAttributes::MINIMAL_REQUESTS),
        })
    }

    /// Send the request for the current range over `socket`
    pub(crate) fn issue_request(&mut self, id: SourceId, socket: Socket) {
        let Some(plan) = self.request_plan(id) else {
            self.close_connection(socket.id);
            return;
        };
        self.connections.insert(socket.id, id);

        match self.collab.headers.send_request(socket.id, &plan) {
            Ok(()) => {
                tracing::debug!("{} requested {} ({})", id, plan.range(), plan.attempt);
                if let Some(peer) = self.sources.get(&id).map(|s| s.peer) {
                    if let Some(peer) = self.registry.get_mut(peer) {
                        peer.last_request = Some(self.now);
                    }
                }
                self.transition(id, SourceState::Headers { socket });
                if let Some(source) = self.sources.get_mut(&id) {
                    source.last_activity = self.now;
                }
            }
            Err(e) => {
                self.close_connection(socket.id);
                self.handle_failure(id, e);
            }
        }
    }

    /// Response headers arrived for a Source
    pub fn on_response(&mut self, id: SourceId, info: ResponseInfo) {
        self.refresh_now();
        if self.sources.get(&id).map(|s| s.status()) != Some(SourceStatus::Headers) {
            tracing::debug!("Ignoring response for {} outside Headers", id);
            return;
        }
        let Some(SourceState::Headers { socket }) = self.transition(id, SourceState::Waiting) else {
            return;
        };
        let Some(peer_id) = self.sources.get(&id).map(|s| s.peer) else {
            return;
        };

        self.learn_from_response(id, peer_id, &info);

        if info.is_success() {
            self.accept_body(id, socket, &info);
            return;
        }

        match info.status {
            503 => self.handle_busy(id, socket, &info),
            416 => self.handle_range_unavailable(id, socket, &info),
            401 | 403 | 429 => {
                self.close_connection(socket.id);
                self.handle_refusal(id, peer_id, &info);
            }
            404 | 410 => {
                self.close_connection(socket.id);
                self.handle_failure(
                    id,
                    TransferError::protocol(
                        ProtocolErrorKind::FileNotFound,
                        format!("{} {}", info.status, info.reason),
                    ),
                );
            }
            500..=599 => {
                self.close_connection(socket.id);
                self.handle_failure(
                    id,
                    TransferError::network(
                        NetworkErrorKind::HttpStatus(info.status),
                        format!("{} {}", info.status, info.reason),
                    ),
                );
            }
            _ => {
                self.close_connection(socket.id);
                self.handle_failure(
                    id,
                    TransferError::protocol(
                        ProtocolErrorKind::InvalidResponse,
                        format!("Unexpected status {} {}", info.status, info.reason),
                    ),
                );
            }
        }
    }

    fn learn_from_response(&mut self, id: SourceId, peer_id: PeerId, info: &ResponseInfo) {
        let keep_alive = info.keep_alive;
        if let Some(peer) = self.registry.get_mut(peer_id) {
            if let Some(server) = &info.server {
                peer.server = Some(server.clone());
            }
            if !info.push_proxies.is_empty() {
                peer.push_proxies.replace(info.push_proxies.clone());
            }
        }
        let no_keepalive = self
            .registry
            .get(peer_id)
            .map(|p| p.has(PeerAttributes::NO_KEEPALIVE))
            .unwrap_or(true);
        if let Some(source) = self.sources.get_mut(&id) {
            source.flags.replied = true;
            source.flags.keep_alive = keep_alive && !no_keepalive;
            if info.available_ranges.is_some() {
                source.availability = info.available_ranges.clone();
            }
        }
    }

    /// 2xx: validate what is served, reserve buffers, start receiving
    fn accept_body(&mut self, id: SourceId, mut socket: Socket, info: &ResponseInfo) {
        let Some((file_id, peer_id)) = self.sources.get(&id).map(|s| (s.file, s.peer)) else {
            return;
        };
        let Some(plan) = self.request_plan(id) else {
            self.close_connection(socket.id);
            return;
        };

        let accepted = match self.check_served(file_id, &plan, info) {
            Ok(range) => range,
            Err(e) => {
                self.close_connection(socket.id);
                self.handle_failure(id, e);
                return;
            }
        };

        let Some(borrowed) = self.pool.acquire(self.config.buffers.chunks_per_source) else {
            let delay = Duration::from_secs(self.config.retry.buffer_delay);
            if let Some(source) = self.sources.get_mut(&id) {
                source.flags.keep_alive = false;
            }
            self.close_connection(socket.id);
            let reason = TransferError::ResourceLimit {
                resource: "buffers",
                limit: self.config.buffers.max_chunks,
            }
            .to_string();
            self.requeue(id, delay, &reason, SourceState::Queued);
            return;
        };

        if let Some(source) = self.sources.get_mut(&id) {
            source.range_end = accepted.end;
            source.retries = 0;
        }
        if let Some(peer) = self.registry.get_mut(peer_id) {
            peer.failures = 0;
        }

        let recv = std::mem::take(&mut socket.recv);
        let buffers = Buffers::new(recv, borrowed, self.config.buffers.chunk_size);
        self.transition(id, SourceState::Receiving { socket, buffers });
    }

    /// Check the advertised hash and served range, learning the file size
    /// and hash when we did not know them yet
    fn check_served(
        &mut self,
        file_id: FileId,
        plan: &RequestPlan,
        info: &ResponseInfo,
    ) -> Result<ByteRange> {
        let file = self
            .files
            .get_mut(&file_id)
            .ok_or_else(|| TransferError::NotFound(file_id.to_string()))?;

        if let (Some(ours), Some(theirs)) = (&file.hash, &info.content_hash) {
            if !ours.eq_ignore_ascii_case(theirs) {
                return Err(TransferError::protocol(
                    ProtocolErrorKind::HashMismatch,
                    format!("Peer serves {} instead of {}", theirs, ours),
                ));
            }
        }
        if file.hash.is_none() {
            file.hash = info.content_hash.clone();
        }

        let served = match (info.content_range, info.content_length) {
            (Some(range), _) => range,
            (None, Some(len)) if info.status == 200 && len > 0 => {
                ContentRange::new(0, len - 1, Some(len))
            }
            _ => {
                return Err(TransferError::protocol(
                    ProtocolErrorKind::InvalidResponse,
                    "No range served",
                ))
            }
        };

        if file.size.is_none() {
            if let Some(total) = served.total {
                file.size = Some(total);
                file.assembly.on_size_known(total);
                tracing::debug!("{} size is {}", file_id, total);
            }
        }

        if plan.end == u64::MAX && served.start == plan.start {
            // Open-ended request for a file of unknown size
            return Ok(served.range());
        }
        validate_served_range(plan, &served, file.size, file.swarming)
    }

    /// 503: queued remotely, or plainly busy
    fn handle_busy(&mut self, id: SourceId, socket: Socket, info: &ResponseInfo) {
        if let Some(peer) = self.sources.get(&id).map(|s| s.peer) {
            if let Some(peer) = self.registry.get_mut(peer) {
                peer.failures = 0;
            }
        }

        match &info.queue {
            Some(queue) => {
                if let Some(source) = self.sources.get_mut(&id) {
                    source.remote_queue = Some(queue.id.clone());
                }
                let keep = queue.active && info.keep_alive;
                if keep {
                    let wait = queue.retry_after.min(self.config.active_queue_timeout());
                    tracing::debug!(
                        "{} actively queued at {}/{} for {:?}",
                        id,
                        queue.position,
                        queue.length,
                        wait
                    );
                    self.transition(
                        id,
                        SourceState::ActiveQueued {
                            socket,
                            queue_id: queue.id.clone(),
                            retry_at: self.now + wait,
                        },
                    );
                } else {
                    self.close_connection(socket.id);
                    let reason = format!("Remotely queued at {}/{}", queue.position, queue.length);
                    self.requeue(
                        id,
                        queue.retry_after,
                        &reason,
                        SourceState::PassiveQueued {
                            queue_id: queue.id.clone(),
                        },
                    );
                }
            }
            None => {
                self.close_connection(socket.id);
                let delay = info
                    .retry_after
                    .unwrap_or_default()
                    .max(Duration::from_secs(self.config.retry.busy_delay));
                self.requeue(id, delay, "Busy", SourceState::Queued);
            }
        }
    }

    /// 416: the peer lacks the range; learn its ranges and ask again
    fn handle_range_unavailable(&mut self, id: SourceId, socket: Socket, info: &ResponseInfo) {
        let has_ranges = self
            .sources
            .get(&id)
            .map(|s| s.availability.is_some())
            .unwrap_or(false);
        if !has_ranges {
            self.close_connection(socket.id);
            self.handle_failure(
                id,
                TransferError::protocol(
                    ProtocolErrorKind::RangeMismatch,
                    "Range unavailable and no ranges advertised",
                ),
            );
            return;
        }

        let body = info.content_length.unwrap_or(0);
        let reusable = self.sources.get(&id).map(|s| s.flags.keep_alive).unwrap_or(false);
        if reusable && body > 0 {
            self.transition(id, SourceState::Sinking { socket, remaining: body });
        } else if reusable {
            self.after_sink(id, socket);
        } else {
            self.close_connection(socket.id);
            let delay = Duration::from_secs(self.config.retry.chunks_busy_delay);
            self.requeue(id, delay, "Requested range unavailable", SourceState::Queued);
        }
    }

    /// Body discarded: request a new range over the same connection
    pub(crate) fn after_sink(&mut self, id: SourceId, socket: Socket) {
        if let Some(source) = self.sources.get_mut(&id) {
            source.new_attempt();
        }
        if self.allocate_range(id) {
            self.issue_request(id, socket);
        } else {
            self.close_connection(socket.id);
        }
    }

    /// 401/403/429: hostile unless the peer runs our own software
    fn handle_refusal(&mut self, id: SourceId, peer_id: PeerId, info: &ResponseInfo) {
        let same_vendor = info
            .server
            .as_deref()
            .map(|s| s.to_ascii_lowercase().starts_with(&self.config.vendor.to_ascii_lowercase()))
            .unwrap_or(false);

        if same_vendor {
            let delay = Duration::from_secs(self.config.retry.busy_delay);
            self.requeue(id, delay, "Refused by same vendor, treating as busy", SourceState::Queued);
            return;
        }

        if let Some(peer) = self.registry.get_mut(peer_id) {
            peer.attributes
                .insert(PeerAttributes::BANNING | PeerAttributes::MINIMAL_REQUESTS);
        }
        tracing::info!("{} refuses us ({} {})", peer_id, info.status, info.reason);
        let hold = Duration::from_secs(self.config.retry.ban_delay);
        let reason = TransferError::Refused {
            status: info.status,
            message: info.reason.clone(),
        }
        .to_string();
        let _ = self.queue_hold(id, hold, &reason);
    }

    /// Apply the recovery policy for an error
    pub(crate) fn handle_failure(&mut self, id: SourceId, error: TransferError) {
        match error.class() {
            FailureClass::Transient => self.fail_transient(id, &error),
            FailureClass::ProtocolMismatch => {
                self.mesh_removal(id, &error.to_string());
                let _ = self.stop_with(
                    id,
                    SourceState::Error {
                        reason: error.to_string(),
                    },
                    &error.to_string(),
                );
            }
            FailureClass::Refusal => {
                let hold = Duration::from_secs(self.config.retry.ban_delay);
                let _ = self.queue_hold(id, hold, &error.to_string());
            }
            FailureClass::ResumeMismatch => self.resume_mismatch(id),
            FailureClass::LocalIo | FailureClass::Usage => {
                tracing::warn!("{} stopped: {}", id, error);
                let _ = self.stop_with(
                    id,
                    SourceState::Error {
                        reason: error.to_string(),
                    },
                    &error.to_string(),
                );
            }
        }
    }

    /// Back off after a transient failure; too many in a row and the whole
    /// peer is given up on
    pub(crate) fn fail_transient(&mut self, id: SourceId, error: &TransferError) {
        let now = self.now;
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        if source.flags.no_retry || !error.is_retryable() {
            let reason = error.to_string();
            let _ = self.stop_with(id, SourceState::Error { reason: reason.clone() }, &reason);
            return;
        }

        let ran_for = source
            .run_start
            .take()
            .map(|t| now.saturating_since(t))
            .unwrap_or_default();
        let delay = self.backoff.next_delay(source.last_delay, ran_for);
        source.last_delay = delay;
        source.retries += 1;
        let peer_id = source.peer;

        let failures = match self.registry.get_mut(peer_id) {
            Some(peer) => {
                peer.failures += 1;
                peer.failures
            }
            None => 0,
        };
        if failures >= self.config.retry.max_failures {
            self.peer_unavailable(peer_id, &error.to_string());
            return;
        }

        tracing::debug!("{} failed ({}), retry in {:?}", id, error, delay);
        self.requeue(id, delay, &error.to_string(), SourceState::TimeoutWait);
    }

    /// Stop every waiting and running Source of a peer that keeps failing
    pub(crate) fn peer_unavailable(&mut self, peer_id: PeerId, last_error: &str) {
        let Some(peer) = self.registry.get_mut(peer_id) else {
            return;
        };
        peer.attributes.insert(PeerAttributes::UNAVAILABLE);
        let affected: Vec<SourceId> = peer.waiting.iter().chain(peer.running.iter()).copied().collect();

        tracing::warn!(
            "{} unavailable after {} failures ({}), stopping {} sources",
            peer_id,
            peer.failures,
            last_error,
            affected.len()
        );
        let reason = format!("Peer unavailable: {}", last_error);
        for id in affected {
            let _ = self.stop_with(id, SourceState::Error { reason: reason.clone() }, &reason);
        }
        self.emit(TransferEvent::PeerUnavailable { peer: peer_id });
    }

    /// Tell the mesh this Source is bad
    pub(crate) fn mesh_removal(&mut self, id: SourceId, reason: &str) {
        let Some((file, peer)) = self.sources.get(&id).map(|s| (s.file, s.peer)) else {
            return;
        };
        let Some(addr) = self.registry.get(peer).map(|p| p.identity.addr) else {
            return;
        };
        self.emit(TransferEvent::MeshRemoval {
            file,
            addr,
            reason: reason.to_string(),
        });
    }

    /// Whether a Source is in a Running state that owns `conn`
    pub(crate) fn owns_connection(&self, id: SourceId, conn: ConnectionId) -> bool {
        self.sources
            .get(&id)
            .map(|s| s.list == ListMarker::Running && s.state.connection() == Some(conn))
            .unwrap_or(false)
    }
}
