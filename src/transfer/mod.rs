//! Transfer manager - single owner of the transfer core
//!
//! The `TransferManager` owns the peer registry, every Source and file, the
//! buffer pool and the collaborators it drives. All mutation goes through
//! `&mut self`, so list membership, reference counts and the retry index are
//! never observed half-updated. Time only advances when [`TransferManager::tick`]
//! samples the injected clock.

mod push;
mod receive;
mod response;
mod scheduler;

pub use scheduler::TickReport;

use crate::assembly::{AssemblyProvider, FileAssembly, FileSpec};
use crate::backoff::RetryPolicy;
use crate::buffers::BufferPool;
use crate::chunk::ChunkAllocator;
use crate::clock::Clock;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::events::TransferEvent;
use crate::peer::{Peer, PeerAttributes};
use crate::persist::SourceRecord;
use crate::push::PushRouting;
use crate::registry::PeerRegistry;
use crate::source::{ListMarker, Source, SourceState, SourceStatus};
use crate::transport::{ConnectionId, Connector, HeaderExchange};
use crate::types::{ByteRange, FileId, PeerId, PeerIdentity, SourceId, Timestamp};
use crate::verify::{FileRelocation, HashVerification};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// External components the manager drives
pub struct Collaborators {
    pub connector: Box<dyn Connector>,
    pub headers: Box<dyn HeaderExchange>,
    pub push: Box<dyn PushRouting>,
    pub verifier: Box<dyn HashVerification>,
    pub relocation: Box<dyn FileRelocation>,
    pub assemblies: Box<dyn AssemblyProvider>,
}

/// A file being downloaded
pub struct TransferFile {
    pub(crate) id: FileId,
    pub(crate) name: String,
    pub(crate) size: Option<u64>,
    pub(crate) hash: Option<String>,
    pub(crate) swarming: bool,
    pub(crate) assembly: Box<dyn FileAssembly>,
    pub(crate) sources: Vec<SourceId>,
    pub(crate) destination: Option<PathBuf>,
    pub(crate) completed: bool,
}

impl TransferFile {
    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn swarming(&self) -> bool {
        self.swarming
    }

    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

impl std::fmt::Debug for TransferFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("swarming", &self.swarming)
            .field("sources", &self.sources.len())
            .field("completed", &self.completed)
            .finish()
    }
}

/// A Source to be added for a file
#[derive(Debug, Clone)]
pub struct NewSource {
    pub identity: PeerIdentity,
    /// Index of the file on the remote peer
    pub file_index: u32,
    pub hostname: Option<String>,
    /// The peer is firewalled
    pub push_needed: bool,
    pub push_proxies: Vec<SocketAddr>,
    /// Remote queue slot held from a previous session
    pub queue_id: Option<String>,
}

impl NewSource {
    pub fn new(identity: PeerIdentity, file_index: u32) -> Self {
        Self {
            identity,
            file_index,
            hostname: None,
            push_needed: false,
            push_proxies: Vec::new(),
            queue_id: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Mark the peer as reachable only through a push
    pub fn firewalled(mut self) -> Self {
        self.push_needed = true;
        self
    }

    pub fn with_push_proxies(mut self, proxies: Vec<SocketAddr>) -> Self {
        self.push_proxies = proxies;
        self
    }
}

/// The transfer core
pub struct TransferManager {
    pub(crate) config: TransferConfig,
    clock: Arc<dyn Clock>,
    /// Sampled once per tick and on every external call
    pub(crate) now: Timestamp,
    pub(crate) registry: PeerRegistry,
    pub(crate) sources: HashMap<SourceId, Source>,
    pub(crate) files: HashMap<FileId, TransferFile>,
    pub(crate) connections: HashMap<ConnectionId, SourceId>,
    next_source: u64,
    next_file: u64,
    next_seq: u64,
    /// Sources in Running lists
    pub(crate) running: usize,
    pub(crate) pool: BufferPool,
    pub(crate) allocator: ChunkAllocator,
    pub(crate) backoff: RetryPolicy,
    pub(crate) rng: Box<dyn RngCore + Send>,
    pub(crate) collab: Collaborators,
    events: Vec<TransferEvent>,
}

impl TransferManager {
    /// Create a manager; fails if the configuration is invalid
    pub fn new(
        config: TransferConfig,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let now = clock.now();
        Ok(Self {
            registry: PeerRegistry::new(config.retry_buckets, config.request_spacing()),
            pool: BufferPool::new(config.buffers.chunk_size, config.buffers.max_chunks),
            allocator: ChunkAllocator::new(config.resume.overlap_size, config.swarm_chunk_size),
            backoff: RetryPolicy::from_config(&config.retry),
            rng: Box::new(StdRng::from_entropy()),
            config,
            clock,
            now,
            sources: HashMap::new(),
            files: HashMap::new(),
            connections: HashMap::new(),
            next_source: 1,
            next_file: 1,
            next_seq: 0,
            running: 0,
            collab: collaborators,
            events: Vec::new(),
        })
    }

    /// Replace the random source used by the resume mismatch policy
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Replace the backoff policy (e.g. to add jitter)
    pub fn with_backoff(mut self, policy: RetryPolicy) -> Self {
        self.backoff = policy;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub(crate) fn refresh_now(&mut self) {
        self.now = self.clock.now().max(self.now);
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.registry.get(id)
    }

    pub fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(&id)
    }

    pub fn file(&self, id: FileId) -> Option<&TransferFile> {
        self.files.get(&id)
    }

    pub fn file_by_name(&self, name: &str) -> Option<FileId> {
        self.files.values().find(|f| f.name == name).map(|f| f.id)
    }

    pub fn source_ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<_> = self.sources.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Sources currently in Running lists
    pub fn running_count(&self) -> usize {
        self.running
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Take all events queued since the last call
    pub fn drain_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn emit(&mut self, event: TransferEvent) {
        self.events.push(event);
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Register a file. A file with the same name is returned as is.
    pub fn add_file(&mut self, spec: FileSpec) -> Result<FileId> {
        if spec.name.is_empty() {
            return Err(TransferError::invalid_input("name", "File name is empty"));
        }
        if let Some(existing) = self.file_by_name(&spec.name) {
            return Ok(existing);
        }
        if spec.swarming && spec.size.is_none() {
            return Err(TransferError::invalid_input(
                "size",
                "Swarming requires a known file size",
            ));
        }

        let assembly = self.collab.assemblies.open(&spec)?;
        let id = FileId(self.next_file);
        self.next_file += 1;

        let completed = assembly.is_complete();
        self.files.insert(
            id,
            TransferFile {
                id,
                name: spec.name.clone(),
                size: spec.size.or_else(|| assembly.size()),
                hash: spec.hash,
                swarming: spec.swarming,
                assembly,
                sources: Vec::new(),
                destination: None,
                completed,
            },
        );

        tracing::info!("Added file {} '{}'", id, spec.name);
        self.emit(TransferEvent::FileAdded {
            file: id,
            name: spec.name,
        });
        Ok(id)
    }

    /// Where a verified file is moved to
    pub fn set_destination(&mut self, file: FileId, destination: impl Into<PathBuf>) -> Result<()> {
        let entry = self
            .files
            .get_mut(&file)
            .ok_or_else(|| TransferError::NotFound(file.to_string()))?;
        entry.destination = Some(destination.into());
        Ok(())
    }

    /// Add a Source for `file`. Adding the same peer and file index twice
    /// returns the existing Source.
    pub fn add_source(&mut self, file: FileId, new: NewSource) -> Result<SourceId> {
        self.refresh_now();
        let entry = self
            .files
            .get(&file)
            .ok_or_else(|| TransferError::NotFound(file.to_string()))?;
        if entry.completed {
            return Err(TransferError::InvalidState {
                action: "add source",
                current_state: format!("{} completed", file),
            });
        }

        let peer_id = self.registry.get_or_create(new.identity);

        if let Some(existing) = self.find_duplicate(peer_id, file, new.file_index) {
            tracing::debug!("Duplicate source for {} on {}", file, peer_id);
            return Ok(existing);
        }

        if new.push_needed {
            self.registry.set_push_needed(peer_id, true);
        }
        let peer = self.registry.expect_mut(peer_id)?;
        if new.hostname.is_some() {
            peer.hostname = new.hostname.clone();
        }
        for proxy in &new.push_proxies {
            peer.push_proxies.add(*proxy);
        }
        if peer.has(PeerAttributes::UNAVAILABLE) {
            // Fresh evidence the peer exists; give it another chance
            peer.attributes.remove(PeerAttributes::UNAVAILABLE);
            peer.failures = 0;
        }

        let id = SourceId(self.next_source);
        self.next_source += 1;
        let seq = self.next_seq();

        let mut source = Source::new(id, file, new.file_index, peer_id, self.now, seq);
        source.remote_queue = new.queue_id.clone();
        let state = match new.queue_id {
            Some(queue_id) => SourceState::PassiveQueued { queue_id },
            None => SourceState::Queued,
        };
        source.state = state;
        source.list = ListMarker::Waiting;

        self.sources.insert(id, source);
        self.registry.acquire(peer_id);
        if let Some(peer) = self.registry.get_mut(peer_id) {
            peer.attach(id, ListMarker::Waiting);
        }
        if let Some(entry) = self.files.get_mut(&file) {
            entry.sources.push(id);
            entry.assembly.lifecount(1);
        }
        self.reindex_peer(peer_id);

        tracing::debug!("Added source {} for {} on {}", id, file, peer_id);
        self.emit(TransferEvent::SourceAdded {
            source: id,
            file,
            peer: peer_id,
        });
        Ok(id)
    }

    fn find_duplicate(&self, peer: PeerId, file: FileId, file_index: u32) -> Option<SourceId> {
        let peer = self.registry.get(peer)?;
        peer.all_sources().into_iter().find(|s| {
            self.sources
                .get(s)
                .map(|src| src.file == file && src.file_index == file_index)
                .unwrap_or(false)
        })
    }

    /// Destroy a Source, releasing everything it holds
    pub fn remove_source(&mut self, id: SourceId) -> Result<()> {
        if !self.sources.contains_key(&id) {
            return Err(TransferError::NotFound(id.to_string()));
        }
        self.refresh_now();

        if let Some(old) = self.transition(id, SourceState::Removed) {
            self.dispose(id, old);
        }

        let Some(source) = self.sources.remove(&id) else {
            return Ok(());
        };
        self.registry.release(source.peer);
        if let Some(entry) = self.files.get_mut(&source.file) {
            entry.sources.retain(|s| *s != id);
            entry.assembly.lifecount(-1);
        }

        tracing::debug!("Removed source {}", id);
        self.emit(TransferEvent::SourceRemoved { source: id });
        Ok(())
    }

    /// Stop a Source as aborted. Stopping a stopped Source does nothing.
    pub fn stop(&mut self, id: SourceId, reason: &str) -> Result<()> {
        self.refresh_now();
        self.stop_with(id, SourceState::Aborted, reason)
    }

    /// Exclude a waiting Source from scheduling, or make it eligible again
    pub fn suspend(&mut self, id: SourceId, suspended: bool) -> Result<()> {
        let source = self
            .sources
            .get_mut(&id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        source.flags.suspended = suspended;
        Ok(())
    }

    /// Put a Source back in its peer's Waiting list for `delay`
    pub fn queue_delay(&mut self, id: SourceId, delay: Duration, reason: &str) -> Result<()> {
        self.refresh_now();
        self.check_queueable(id)?;
        self.requeue(id, delay, reason, SourceState::Queued);
        Ok(())
    }

    /// Like [`queue_delay`](Self::queue_delay), and also hold back every
    /// Source of the same peer for `hold`
    pub fn queue_hold(&mut self, id: SourceId, hold: Duration, reason: &str) -> Result<()> {
        self.refresh_now();
        let peer_id = self.check_queueable(id)?;

        let until = self.now + hold;
        if let Some(peer) = self.registry.get_mut(peer_id) {
            peer.hold_until = peer.hold_until.max(until);
        }
        tracing::debug!("Holding {} until {:?}: {}", peer_id, until, reason);
        self.requeue(id, hold, reason, SourceState::Queued);
        Ok(())
    }

    /// A Source can be queued unless it was removed or its file is done.
    /// Returns its peer.
    fn check_queueable(&self, id: SourceId) -> Result<PeerId> {
        let source = self
            .sources
            .get(&id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if source.status() == SourceStatus::Removed {
            return Err(TransferError::InvalidState {
                action: "queue",
                current_state: source.status().to_string(),
            });
        }
        let file = source.file;
        if self.files.get(&file).map(|f| f.completed).unwrap_or(true) {
            return Err(TransferError::InvalidState {
                action: "queue",
                current_state: format!("{} completed", file),
            });
        }
        Ok(source.peer)
    }

    /// Requeue with a given waiting state, releasing what the Source held
    pub(crate) fn requeue(&mut self, id: SourceId, delay: Duration, reason: &str, next: SourceState) {
        let seq = self.next_seq();
        let now = self.now;
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        source.retry_after = now + delay;
        source.queue_seq = seq;
        source.last_reason = Some(reason.to_string());

        if let Some(old) = self.transition(id, next) {
            self.dispose(id, old);
        }
        // Still Waiting before and after: the retry time moved anyway
        if let Some(peer) = self.sources.get(&id).map(|s| s.peer) {
            self.reindex_peer(peer);
        }

        tracing::debug!("Queued {} for {:?}: {}", id, delay, reason);
        self.emit(TransferEvent::Queued {
            source: id,
            delay_ms: delay.as_millis() as u64,
            reason: reason.to_string(),
        });
    }

    /// Move a Source into a stopped state. No-op if it already is.
    pub(crate) fn stop_with(&mut self, id: SourceId, terminal: SourceState, reason: &str) -> Result<()> {
        let source = self
            .sources
            .get_mut(&id)
            .ok_or_else(|| TransferError::NotFound(id.to_string()))?;
        if matches!(source.list, ListMarker::Stopped | ListMarker::None) {
            return Ok(());
        }
        source.last_reason = Some(reason.to_string());
        let status = terminal.status();

        if let Some(old) = self.transition(id, terminal) {
            self.dispose(id, old);
        }

        tracing::debug!("Stopped {} ({}): {}", id, status, reason);
        self.emit(TransferEvent::Stopped {
            source: id,
            status,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Stop every other Source of `file` that is waiting or running
    pub(crate) fn stop_siblings(&mut self, file: FileId, except: SourceId, reason: &str) {
        let siblings: Vec<SourceId> = self
            .files
            .get(&file)
            .map(|f| f.sources.iter().copied().filter(|s| *s != except).collect())
            .unwrap_or_default();
        for sibling in siblings {
            let _ = self.stop_with(sibling, SourceState::Aborted, reason);
        }
    }

    /// Replace a Source's state, keeping lists, counters and the retry
    /// index consistent. Returns the previous state so the caller decides
    /// what happens to what it owned.
    pub(crate) fn transition(&mut self, id: SourceId, next: SourceState) -> Option<SourceState> {
        let now = self.now;
        let source = self.sources.get_mut(&id)?;
        let new_status = next.status();
        let old = source.take_state(next);
        let old_status = old.status();
        let old_list = source.list;
        let new_list = new_status.list();
        let peer_id = source.peer;

        source.list = new_list;
        // Only time spent receiving counts against the next backoff
        if new_status == SourceStatus::Receiving {
            if old_status != SourceStatus::Receiving {
                source.run_start = Some(now);
            }
        } else {
            source.run_start = None;
        }
        if old_status != new_status {
            source.last_activity = now;
        }

        if old_list != new_list {
            if let Some(peer) = self.registry.get_mut(peer_id) {
                peer.detach(id, old_list);
                peer.attach(id, new_list);
            }
            if old_list == ListMarker::Running {
                self.running -= 1;
            }
            if new_list == ListMarker::Running {
                self.running += 1;
            }
            if old_list == ListMarker::Waiting || new_list == ListMarker::Waiting {
                self.reindex_peer(peer_id);
            }
        }

        if old_status != new_status {
            tracing::trace!("{}: {} -> {}", id, old_status, new_status);
            self.emit(TransferEvent::StateChanged {
                source: id,
                old_state: old_status,
                new_state: new_status,
            });
        }
        Some(old)
    }

    /// Release whatever a left-behind state owned
    pub(crate) fn dispose(&mut self, id: SourceId, old: SourceState) {
        match old {
            SourceState::Connecting { conn } => self.close_connection(conn),
            SourceState::Headers { socket }
            | SourceState::Sinking { socket, .. }
            | SourceState::ActiveQueued { socket, .. } => self.close_connection(socket.id),
            SourceState::Receiving { socket, mut buffers } => {
                if buffers.held() > 0 {
                    // Keep what was received before letting go
                    if let Err(e) = self.flush(id, &mut buffers) {
                        tracing::warn!("Final flush of {} failed: {}", id, e);
                    }
                }
                let (_, borrowed) = buffers.into_parts();
                self.pool.release(borrowed);
                self.close_connection(socket.id);
            }
            _ => {}
        }
    }

    pub(crate) fn close_connection(&mut self, conn: ConnectionId) {
        self.connections.remove(&conn);
        self.collab.connector.close(conn);
    }

    /// Recompute a peer's retry time from its Waiting Sources
    pub(crate) fn reindex_peer(&mut self, peer: PeerId) {
        let earliest = self.registry.get(peer).and_then(|p| {
            p.waiting
                .iter()
                .filter_map(|s| self.sources.get(s))
                .map(|s| s.retry_after)
                .min()
        });
        self.registry.reindex(peer, earliest);
    }

    /// Ranges other running Sources of `file` are fetching
    pub(crate) fn busy_ranges(&self, file: FileId, except: SourceId) -> Vec<ByteRange> {
        let Some(entry) = self.files.get(&file) else {
            return Vec::new();
        };
        entry
            .sources
            .iter()
            .filter(|s| **s != except)
            .filter_map(|s| self.sources.get(s))
            .filter(|s| s.list == ListMarker::Running && s.range_end > s.skip)
            .map(|s| ByteRange::new(s.skip, s.range_end))
            .collect()
    }

    /// Whether any Source of `file` other than `except` is running
    pub(crate) fn file_has_running(&self, file: FileId, except: SourceId) -> bool {
        self.files
            .get(&file)
            .map(|f| {
                f.sources.iter().any(|s| {
                    *s != except
                        && self
                            .sources
                            .get(s)
                            .map(|src| src.list == ListMarker::Running)
                            .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// Fold a peer whose address changed into the record for `new_addr`.
    ///
    /// Every Source moves to the canonical record keeping its list; one
    /// that duplicates a Source already there is removed. The stale record
    /// ends up unreferenced and is reclaimed on the next tick. Returns the
    /// canonical peer.
    pub fn merge_on_address_change(&mut self, stale: PeerId, new_addr: SocketAddr) -> Result<PeerId> {
        self.refresh_now();
        let stale_identity = *self
            .registry
            .get(stale)
            .ok_or_else(|| TransferError::NotFound(stale.to_string()))?
            .identity();
        if stale_identity.addr == new_addr {
            return Ok(stale);
        }

        let mut absorbed = vec![stale];
        let canonical = match self.registry.find_by_addr(&new_addr) {
            Some(owner) if owner != stale => {
                let owner_blank = self
                    .registry
                    .get(owner)
                    .map(|p| p.identity.guid.is_blank())
                    .unwrap_or(true);
                if owner_blank && !stale_identity.guid.is_blank() {
                    // The anonymous owner is the same servent; the known GUID wins
                    absorbed.push(owner);
                    let id = self
                        .registry
                        .create(PeerIdentity::new(stale_identity.guid, new_addr));
                    self.registry.claim_addr(id);
                    id
                } else {
                    owner
                }
            }
            _ => {
                let id = self
                    .registry
                    .create(PeerIdentity::new(stale_identity.guid, new_addr));
                self.registry.claim_addr(id);
                id
            }
        };

        for from in absorbed {
            if from == canonical {
                continue;
            }
            self.inherit_peer_details(from, canonical);
            self.migrate_sources(from, canonical);
            tracing::info!("Merged {} into {} at {}", from, canonical, new_addr);
            self.emit(TransferEvent::PeerMerged {
                from,
                into: canonical,
            });
        }
        self.reindex_peer(canonical);
        Ok(canonical)
    }

    fn inherit_peer_details(&mut self, from: PeerId, into: PeerId) {
        let Some(old) = self.registry.get(from) else {
            return;
        };
        let hostname = old.hostname.clone();
        let server = old.server.clone();
        let proxies: Vec<SocketAddr> = old.push_proxies.iter().copied().collect();

        if let Some(peer) = self.registry.get_mut(into) {
            if peer.hostname.is_none() {
                peer.hostname = hostname;
            }
            if peer.server.is_none() {
                peer.server = server;
            }
            for proxy in proxies {
                peer.push_proxies.add(proxy);
            }
        }
    }

    fn migrate_sources(&mut self, from: PeerId, to: PeerId) {
        let moving = self
            .registry
            .get(from)
            .map(|p| p.all_sources())
            .unwrap_or_default();

        for id in moving {
            let Some((file, index, list)) = self
                .sources
                .get(&id)
                .map(|s| (s.file, s.file_index, s.list))
            else {
                continue;
            };

            if self.find_duplicate(to, file, index).is_some() {
                tracing::debug!("{} duplicates a source on {}, removing", id, to);
                let _ = self.remove_source(id);
                continue;
            }

            if let Some(peer) = self.registry.get_mut(from) {
                peer.detach(id, list);
            }
            if let Some(peer) = self.registry.get_mut(to) {
                peer.attach(id, list);
            }
            if let Some(source) = self.sources.get_mut(&id) {
                source.peer = to;
            }
            self.registry.release(from);
            self.registry.acquire(to);
        }
        self.reindex_peer(from);
    }

    /// Records for every Source worth restoring next session
    pub fn snapshot_records(&self) -> Vec<SourceRecord> {
        let mut records = Vec::new();
        for id in self.source_ids() {
            let Some(source) = self.sources.get(&id) else {
                continue;
            };
            let status = source.status();
            if !(status.is_waiting() || status.is_running() || status == SourceStatus::Aborted) {
                continue;
            }
            let (Some(file), Some(peer)) = (self.files.get(&source.file), self.registry.get(source.peer))
            else {
                continue;
            };
            if file.completed {
                continue;
            }
            records.push(SourceRecord {
                name: file.name.clone(),
                size: file.size,
                file_index: source.file_index,
                guid: peer.identity.guid,
                addr: peer.identity.addr,
                hostname: peer.hostname.clone(),
                hash: file.hash.clone(),
                queue_id: source.remote_queue.clone(),
            });
        }
        records
    }

    /// Re-create files and Sources from persisted records through the same
    /// path interactive additions take. Returns how many Sources exist
    /// afterwards for those records.
    pub fn restore(&mut self, records: &[SourceRecord]) -> Result<usize> {
        let mut restored = HashSet::new();
        for record in records {
            let file = match self.add_file(FileSpec {
                name: record.name.clone(),
                size: record.size,
                hash: record.hash.clone(),
                swarming: record.size.is_some(),
            }) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!("Cannot restore '{}': {}", record.name, e);
                    continue;
                }
            };

            let mut new = NewSource::new(
                PeerIdentity::new(record.guid, record.addr),
                record.file_index,
            );
            new.hostname = record.hostname.clone();
            new.queue_id = record.queue_id.clone();

            match self.add_source(file, new) {
                Ok(id) => {
                    restored.insert(id);
                }
                Err(e) => tracing::warn!("Cannot restore source for '{}': {}", record.name, e),
            }
        }
        tracing::info!("Restored {} sources", restored.len());
        Ok(restored.len())
    }

    /// Check list membership, reference counts and index ordering.
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let mut running = 0;
        for peer in self.registry.iter() {
            let referencing = self.sources.values().filter(|s| s.peer == peer.id).count();
            if referencing != peer.refcount {
                return Err(format!(
                    "{} refcount {} but {} sources point at it",
                    peer.id, peer.refcount, referencing
                ));
            }
            for marker in [ListMarker::Waiting, ListMarker::Running, ListMarker::Stopped] {
                for id in peer.list(marker).into_iter().flatten() {
                    let source = self
                        .sources
                        .get(id)
                        .ok_or_else(|| format!("{} lists unknown {}", peer.id, id))?;
                    if source.list != marker || source.peer != peer.id {
                        return Err(format!("{} misplaced in {:?} of {}", id, marker, peer.id));
                    }
                }
            }
            let listed = peer.waiting.len() + peer.running.len() + peer.stopped.len();
            if listed != peer.refcount {
                return Err(format!("{} lists {} of {} sources", peer.id, listed, peer.refcount));
            }
            running += peer.running.len();
            let indexed = peer.indexed_at.is_some();
            if indexed != !peer.waiting.is_empty() {
                return Err(format!("{} indexed: {} with {} waiting", peer.id, indexed, peer.waiting.len()));
            }
        }
        for source in self.sources.values() {
            if source.status().list() != source.list {
                return Err(format!(
                    "{} is {} but sits in {:?}",
                    source.id,
                    source.status(),
                    source.list
                ));
            }
        }
        if running != self.running {
            return Err(format!("running counter {} but {} listed", self.running, running));
        }
        if !self.registry.retry_index().is_sorted() {
            return Err("retry index out of order".to_string());
        }
        Ok(())
    }
}
