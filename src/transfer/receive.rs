//! Body reception, overlap verification and completion

use super::TransferManager;
use crate::buffers::Buffers;
use crate::error::{NetworkErrorKind, Result, TransferError};
use crate::events::TransferEvent;
use crate::peer::PeerAttributes;
use crate::source::{SourceState, SourceStatus};
use crate::transport::ConnectionId;
use crate::types::{ByteRange, FileId, SourceId};
use rand::Rng;
use std::time::Duration;

impl TransferManager {
    /// Write held bytes to the file and mark them done. Buffered data
    /// always ends at the Source's `pos`.
    pub(crate) fn flush(&mut self, id: SourceId, buffers: &mut Buffers) -> Result<u64> {
        let held = buffers.held() as u64;
        if held == 0 {
            return Ok(0);
        }
        let (file_id, pos) = self
            .sources
            .get(&id)
            .map(|s| (s.file, s.pos))
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        let file = self
            .files
            .get_mut(&file_id)
            .ok_or_else(|| TransferError::NotFound(file_id.to_string()))?;

        let offset = pos - held;
        let assembly = &mut file.assembly;
        buffers.flush_with(|bytes| assembly.write_at(offset, bytes))?;
        assembly.mark_done(ByteRange::new(offset, offset + held));

        tracing::trace!("{} flushed {} bytes at {}", id, held, offset);
        Ok(held)
    }

    /// Body bytes arrived for a Source
    pub fn on_data(&mut self, id: SourceId, data: &[u8]) {
        self.refresh_now();
        match self.sources.get(&id).map(|s| s.status()) {
            Some(SourceStatus::Receiving) => self.receive(id, data),
            Some(SourceStatus::Sinking) => self.sink(id, data),
            Some(status) => {
                tracing::debug!("Dropping {} bytes for {} in {}", data.len(), id, status)
            }
            None => {}
        }
    }

    fn sink(&mut self, id: SourceId, data: &[u8]) {
        let now = self.now;
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        source.last_activity = now;
        let SourceState::Sinking { remaining, .. } = &mut source.state else {
            return;
        };
        *remaining = remaining.saturating_sub(data.len() as u64);
        if *remaining > 0 {
            return;
        }

        if let Some(SourceState::Sinking { socket, .. }) = self.transition(id, SourceState::Waiting) {
            tracing::debug!("{} discarded unwanted body", id);
            self.after_sink(id, socket);
        }
    }

    fn receive(&mut self, id: SourceId, data: &[u8]) {
        let mut data = data;

        let pending = self.sources.get(&id).map(|s| s.overlap_pending).unwrap_or(0);
        if pending > 0 && !data.is_empty() {
            let n = (pending as usize).min(data.len());
            if !self.check_overlap(id, &data[..n]) {
                return;
            }
            data = &data[n..];
        }
        if data.is_empty() {
            return;
        }

        let now = self.now;
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        let (socket, mut buffers) = match source.take_state(SourceState::Waiting) {
            SourceState::Receiving { socket, buffers } => (socket, buffers),
            other => {
                source.state = other;
                return;
            }
        };

        let remaining = source.range_remaining();
        if data.len() as u64 > remaining {
            tracing::debug!(
                "{} sent {} bytes past the requested range, dropping them",
                id,
                data.len() as u64 - remaining
            );
            data = &data[..remaining as usize];
            source.flags.overflowed = true;
            source.flags.keep_alive = false;
            let peer = source.peer;
            if let Some(peer) = self.registry.get_mut(peer) {
                peer.attributes.insert(PeerAttributes::NO_KEEPALIVE);
            }
        }

        let threshold = self.config.buffers.flush_threshold;
        let min_read = self.config.buffers.min_read;
        let mut outcome = Ok(());
        while !data.is_empty() {
            let n = buffers.add_read(data);
            data = &data[n..];

            let Some(source) = self.sources.get_mut(&id) else {
                break;
            };
            source.pos += n as u64;
            source.received += n as u64;
            source.last_activity = now;
            let to_end = source.range_end - (source.pos - buffers.held() as u64);

            if buffers.free() == 0 || buffers.should_flush(threshold, min_read, to_end) {
                if let Err(e) = self.flush(id, &mut buffers) {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        source.state = SourceState::Receiving { socket, buffers };
        let finished = source.pos >= source.range_end;

        match outcome {
            Err(e) => self.handle_failure(id, e),
            Ok(()) if finished => self.attempt_complete(id),
            Ok(()) => {}
        }
    }

    /// Compare received overlap bytes with what is on disk. Returns false
    /// when they differ and the mismatch policy took over.
    fn check_overlap(&mut self, id: SourceId, received: &[u8]) -> bool {
        let now = self.now;
        let Some((file_id, pos, overlap)) = self.sources.get(&id).map(|s| (s.file, s.pos, s.overlap))
        else {
            return false;
        };
        let Some(file) = self.files.get(&file_id) else {
            return false;
        };

        let mut stored = vec![0u8; received.len()];
        let matches = match file.assembly.read_at(pos, &mut stored) {
            Ok(n) => n == received.len() && stored == received,
            Err(e) => {
                self.handle_failure(id, e);
                return false;
            }
        };

        if !matches {
            tracing::warn!("{} overlap mismatch at {}", id, pos);
            self.mesh_removal(id, "Resume data mismatch");
            self.handle_failure(id, TransferError::ResumeMismatch { offset: pos });
            return false;
        }

        let Some(source) = self.sources.get_mut(&id) else {
            return false;
        };
        source.pos += received.len() as u64;
        source.received += received.len() as u64;
        source.overlap_pending -= received.len() as u64;
        source.last_activity = now;
        if source.overlap_pending == 0 {
            tracing::debug!("{} overlap of {} bytes verified", id, overlap);
            self.emit(TransferEvent::OverlapVerified {
                source: id,
                bytes: overlap,
            });
        }
        true
    }

    /// Truncate the bytes before the resume point and retry, or reject
    /// the Source for now and retry after a backoff, as the configured
    /// policy draws
    pub(crate) fn resume_mismatch(&mut self, id: SourceId) {
        let policy = self.config.resume.mismatch.clone();
        let truncate = self.rng.gen_bool(policy.truncate_probability.clamp(0.0, 1.0));
        let Some((file_id, skip)) = self.sources.get(&id).map(|s| (s.file, s.skip)) else {
            return;
        };

        if truncate {
            let window = ByteRange::new(skip.saturating_sub(policy.truncate_window), skip);
            if let Some(file) = self.files.get_mut(&file_id) {
                file.assembly.mark_empty(window);
            }
            tracing::info!("{} resume mismatch, truncated {}-{}", id, window.start, window.end);
            let delay = Duration::from_secs(self.config.retry.min_delay);
            self.requeue(id, delay, "Resume mismatch, truncated", SourceState::TimeoutWait);
        } else {
            let Some(source) = self.sources.get_mut(&id) else {
                return;
            };
            let delay = self.backoff.next_delay(source.last_delay, Duration::ZERO);
            source.last_delay = delay;
            source.retries += 1;
            let reason = TransferError::ResumeMismatch { offset: skip };
            tracing::info!("{} rejected: {}, retry in {:?}", id, reason, delay);
            self.requeue(
                id,
                delay,
                &format!("Rejected: {}", reason),
                SourceState::TimeoutWait,
            );
        }
    }

    /// The requested range is fully received
    fn attempt_complete(&mut self, id: SourceId) {
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        let file_id = source.file;
        let peer_id = source.peer;
        let attempt = source.attempt;
        let range = ByteRange::new(source.skip, source.range_end);
        source.retries = 0;
        source.last_delay = Duration::ZERO;
        let keep_alive = source.flags.keep_alive && !source.flags.overflowed;
        if let Some(peer) = self.registry.get_mut(peer_id) {
            peer.failures = 0;
        }

        let Some(SourceState::Receiving { mut socket, mut buffers }) =
            self.transition(id, SourceState::Waiting)
        else {
            return;
        };
        let flushed = self.flush(id, &mut buffers);
        let (recv, borrowed) = buffers.into_parts();
        self.pool.release(borrowed);
        socket.recv = recv;

        if let Err(e) = flushed {
            self.close_connection(socket.id);
            self.handle_failure(id, e);
            return;
        }
        self.emit(TransferEvent::AttemptCompleted {
            source: id,
            attempt,
            range,
        });

        let complete = self
            .files
            .get(&file_id)
            .map(|f| f.assembly.is_complete())
            .unwrap_or(false);
        if complete {
            self.close_connection(socket.id);
            self.file_completed(file_id, id);
            return;
        }

        if keep_alive {
            if let Some(source) = self.sources.get_mut(&id) {
                source.new_attempt();
            }
            if self.allocate_range(id) {
                tracing::debug!("{} continues on {}", id, socket.id);
                self.issue_request(id, socket);
            } else {
                self.close_connection(socket.id);
            }
            return;
        }

        self.close_connection(socket.id);
        let delay = Duration::from_secs(self.config.retry.requeue_delay);
        self.requeue(id, delay, "Chunk done", SourceState::Queued);
    }

    /// Every byte of `file` is present: stop everything else and hand the
    /// file to verification
    fn file_completed(&mut self, file_id: FileId, by: SourceId) {
        let Some(file) = self.files.get_mut(&file_id) else {
            return;
        };
        file.completed = true;
        let name = file.name.clone();
        let hash = file.hash.clone();

        let _ = self.stop_with(by, SourceState::Completed, "File completed");
        tracing::info!("{} '{}' completed", file_id, name);
        self.emit(TransferEvent::FileCompleted { file: file_id });
        self.stop_siblings(file_id, by, "File completed by another source");

        match self.collab.verifier.enqueue(file_id, &name, hash.as_deref()) {
            Ok(()) => {
                self.transition(by, SourceState::VerifyWait);
            }
            Err(e) => tracing::warn!("Cannot queue {} for verification: {}", file_id, e),
        }
    }

    /// Connection closed by the remote or by an I/O error
    pub fn on_closed(&mut self, conn: ConnectionId, error: Option<TransferError>) {
        self.refresh_now();
        let Some(&id) = self.connections.get(&conn) else {
            return;
        };
        if !self.owns_connection(id, conn) {
            self.connections.remove(&conn);
            return;
        }
        let Some(status) = self.sources.get(&id).map(|s| s.status()) else {
            return;
        };

        match status {
            SourceStatus::Connecting => {
                self.connections.remove(&conn);
                let error = error.unwrap_or_else(|| {
                    TransferError::network(NetworkErrorKind::ConnectionRefused, "Connection closed")
                });
                if !self.try_push(id) {
                    self.handle_failure(id, error);
                }
            }
            SourceStatus::Receiving => {
                let finished = self
                    .sources
                    .get_mut(&id)
                    .map(|s| {
                        s.flags.keep_alive = false;
                        s.pos >= s.range_end
                    })
                    .unwrap_or(false);
                if finished {
                    self.attempt_complete(id);
                } else {
                    let error = error.unwrap_or_else(|| {
                        TransferError::network(NetworkErrorKind::EarlyEof, "Closed mid-body")
                    });
                    self.fail_transient(id, &error);
                }
            }
            _ => {
                let error = error.unwrap_or_else(|| {
                    TransferError::network(NetworkErrorKind::ConnectionReset, "Connection closed")
                });
                self.fail_transient(id, &error);
            }
        }
    }

    /// The Source that completed `file` and is going through verification
    fn finishing_source(&self, file: FileId) -> Option<SourceId> {
        let entry = self.files.get(&file)?;
        entry.sources.iter().copied().find(|s| {
            self.sources
                .get(s)
                .map(|src| {
                    matches!(
                        src.status(),
                        SourceStatus::Completed
                            | SourceStatus::VerifyWait
                            | SourceStatus::Verifying
                            | SourceStatus::Verified
                            | SourceStatus::MoveWait
                            | SourceStatus::Moving
                    )
                })
                .unwrap_or(false)
        })
    }

    pub fn on_verify_start(&mut self, file: FileId) {
        self.refresh_now();
        if let Some(id) = self.finishing_source(file) {
            self.transition(id, SourceState::Verifying);
        }
    }

    pub fn on_verify_progress(&mut self, file: FileId, hashed: u64) {
        self.refresh_now();
        let now = self.now;
        if let Some(id) = self.finishing_source(file) {
            if let Some(source) = self.sources.get_mut(&id) {
                source.last_activity = now;
            }
            tracing::trace!("{} verification at {} bytes", file, hashed);
        }
    }

    /// Verification finished; a file with a destination moves on to
    /// relocation
    pub fn on_verify_done(&mut self, file: FileId, ok: bool) {
        self.refresh_now();
        let Some(id) = self.finishing_source(file) else {
            return;
        };
        self.emit(TransferEvent::FileVerified { file, ok });

        if !ok {
            tracing::warn!("{} failed verification", file);
            let reason = "Content hash mismatch".to_string();
            self.transition(id, SourceState::Error { reason });
            return;
        }
        self.transition(id, SourceState::Verified);

        let Some((name, destination)) = self
            .files
            .get(&file)
            .and_then(|f| f.destination.clone().map(|d| (f.name.clone(), d)))
        else {
            self.transition(id, SourceState::Done);
            return;
        };

        self.transition(id, SourceState::MoveWait);
        if let Err(e) = self.collab.relocation.move_file(file, &name, &destination) {
            self.on_move_error(file, &e.to_string());
        }
    }

    pub fn on_verify_error(&mut self, file: FileId, reason: &str) {
        self.refresh_now();
        if let Some(id) = self.finishing_source(file) {
            tracing::warn!("{} verification error: {}", file, reason);
            self.transition(
                id,
                SourceState::Error {
                    reason: reason.to_string(),
                },
            );
        }
    }

    pub fn on_move_start(&mut self, file: FileId) {
        self.refresh_now();
        if let Some(id) = self.finishing_source(file) {
            self.transition(id, SourceState::Moving);
        }
    }

    pub fn on_move_done(&mut self, file: FileId) {
        self.refresh_now();
        if let Some(id) = self.finishing_source(file) {
            self.transition(id, SourceState::Done);
            self.emit(TransferEvent::FileMoved { file });
        }
    }

    pub fn on_move_error(&mut self, file: FileId, reason: &str) {
        self.refresh_now();
        if let Some(id) = self.finishing_source(file) {
            tracing::warn!("{} move failed: {}", file, reason);
            self.transition(
                id,
                SourceState::Error {
                    reason: reason.to_string(),
                },
            );
        }
    }
}
