//! # gosh-swarm
//!
//! Transfer-scheduling core for swarmed, resumable peer-to-peer downloads.
//!
//! ## Features
//!
//! - **Peer registry**: one record per remote servent, with retry-time
//!   indexing and address-change merging
//! - **Source state machine**: connection, request, receive and recovery
//!   for every download source, with owned sockets and buffers
//! - **Scheduling**: global and per-peer concurrency caps, FIFO fairness
//! - **Resume integrity**: overlap checking with a configurable mismatch policy
//! - **Swarming**: chunked range allocation across many sources, including
//!   partial-availability (PFSP) peers
//! - **Push fallback**: push-proxies, GUID-routed pushes and GIV correlation
//!
//! The network, file storage and hash verification are collaborators behind
//! traits; the core only decides what happens next.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gosh_swarm::{
//!     Collaborators, FileSpec, NewSource, PeerIdentity, SystemClock, TransferConfig,
//!     TransferManager, TransferService,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(collaborators: Collaborators) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = TransferManager::new(
//!     TransferConfig::default(),
//!     Arc::new(SystemClock::new()),
//!     collaborators,
//! )?;
//! let service = TransferService::start(manager, None).await?;
//!
//! let file = service
//!     .add_file(FileSpec {
//!         name: "album.ogg".into(),
//!         size: Some(4_000_000),
//!         hash: None,
//!         swarming: true,
//!     })
//!     .await?;
//! let peer = PeerIdentity::anonymous("10.0.0.7:6346".parse()?);
//! service.add_source(file, NewSource::new(peer, 3)).await?;
//!
//! let mut events = service.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

// Modules
pub mod assembly;
pub mod backoff;
pub mod buffers;
pub mod chunk;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod persist;
pub mod push;
pub mod registry;
pub mod retry_index;
pub mod service;
pub mod source;
pub mod transfer;
pub mod transport;
pub mod types;
pub mod verify;

// Re-exports for convenience
pub use config::{
    BufferConfig, ResumeConfig, ResumeMismatchPolicy, RetryConfig, TimeoutConfig, TransferConfig,
};
pub use error::{
    FailureClass, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind, TransferError,
};
pub use events::TransferEvent;
pub use service::TransferService;
pub use transfer::{Collaborators, NewSource, TickReport, TransferFile, TransferManager};
pub use types::{AttemptId, ByteRange, FileId, Guid, PeerId, PeerIdentity, RangeSet, SourceId, Timestamp};

// Core building blocks
pub use assembly::{
    AssemblyProvider, ChunkStatus, FileAssembly, FileSpec, Hole, HoleQuery, MemoryAssembly,
    MemoryAssemblyProvider, SharedAssembly,
};
pub use backoff::RetryPolicy;
pub use buffers::{BufferPool, Buffers};
pub use chunk::{Allocation, ChunkAllocator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use peer::{Peer, PeerAttributes};
pub use registry::PeerRegistry;
pub use retry_index::RetryIndex;
pub use source::{ListMarker, Source, SourceFlags, SourceState, SourceStatus};

// Collaborator interfaces
pub use persist::{FileStore, MemoryStore, PersistenceStore, SourceRecord};
pub use push::{Giv, PushProxyList, PushRoute, PushRouting};
pub use transport::{
    ConnectionId, Connector, ContentRange, HeaderExchange, RemoteQueue, RequestPlan,
    ResponseInfo, Socket,
};
pub use verify::{FileRelocation, HashVerification};
