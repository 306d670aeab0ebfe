//! Transfer configuration
//!
//! All tunables of the transfer core: concurrency caps, per-state timeouts,
//! retry backoff, buffer sizing and the resume-integrity policy.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the transfer core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum Sources running at once, across all peers
    pub max_running: usize,

    /// Maximum Sources running at once against a single peer
    pub max_running_per_peer: usize,

    /// Scheduler tick interval in milliseconds
    pub tick_interval_ms: u64,

    /// Number of RetryIndex buckets (power of two)
    pub retry_buckets: usize,

    /// Minimum spacing between two requests to the same peer, in seconds
    pub min_request_spacing_secs: u64,

    /// Minimum spacing between two name lookups for the same peer, in seconds
    pub name_lookup_interval_secs: u64,

    /// Vendor prefix of our own server string; refusals from peers
    /// announcing it are never taken as hostility
    pub vendor: String,

    /// Local port announced in push requests
    pub listen_port: u16,

    /// Size of a swarmed chunk in bytes
    pub swarm_chunk_size: u64,

    /// How often the service saves the source set, in seconds
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,

    /// Per-state timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Retry and backoff policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Buffer pool sizing and flush policy
    #[serde(default)]
    pub buffers: BufferConfig,

    /// Resume integrity checking
    #[serde(default)]
    pub resume: ResumeConfig,
}

/// Per-state timeouts, all in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Waiting for a TCP connect to complete
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,

    /// Waiting for the reverse connection after a push
    #[serde(default = "default_push_timeout")]
    pub push_sent: u64,

    /// Waiting for response headers
    #[serde(default = "default_header_timeout")]
    pub headers: u64,

    /// Waiting for body bytes while receiving or sinking
    #[serde(default = "default_data_timeout")]
    pub data_stall: u64,

    /// Longest we keep a socket open while actively queued remotely
    #[serde(default = "default_active_queue_timeout")]
    pub active_queue: u64,
}

fn default_persist_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_push_timeout() -> u64 {
    60
}

fn default_header_timeout() -> u64 {
    60
}

fn default_data_timeout() -> u64 {
    90
}

fn default_active_queue_timeout() -> u64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            push_sent: default_push_timeout(),
            headers: default_header_timeout(),
            data_stall: default_data_timeout(),
            active_queue: default_active_queue_timeout(),
        }
    }
}

/// Retry policy, delays in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First backoff delay after a failure
    pub min_delay: u64,

    /// Backoff ceiling
    pub max_delay: u64,

    /// Consecutive failures against a peer before it is declared unavailable
    pub max_failures: u32,

    /// Delay when the peer answers busy without queueing us
    pub busy_delay: u64,

    /// Hold applied to a peer that refuses or bans us
    pub ban_delay: u64,

    /// Delay when every hole of a swarmed file is claimed by other sources
    pub chunks_busy_delay: u64,

    /// Delay when no buffers could be reserved
    pub buffer_delay: u64,

    /// Delay before re-requesting after a completed transfer on a closed connection
    pub requeue_delay: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: 20,
            max_delay: 1200,
            max_failures: 8,
            busy_delay: 60,
            ban_delay: 3600,
            chunks_busy_delay: 10,
            buffer_delay: 5,
            requeue_delay: 0,
        }
    }
}

/// Buffer pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Size of one pooled chunk in bytes
    pub chunk_size: usize,

    /// Maximum number of chunks the pool hands out at once
    pub max_chunks: usize,

    /// Chunks borrowed per receiving source (in addition to the socket's own)
    pub chunks_per_source: usize,

    /// Flush to disk once this many bytes are held
    pub flush_threshold: usize,

    /// Flush early when less than this much room is left
    pub min_read: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            max_chunks: 512,
            chunks_per_source: 7,
            flush_threshold: 64 * 1024,
            min_read: 4 * 1024,
        }
    }
}

/// Resume-integrity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// Bytes re-requested before the resume point and compared with disk
    pub overlap_size: u64,

    /// What to do when those bytes differ
    #[serde(default)]
    pub mismatch: ResumeMismatchPolicy,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            overlap_size: 512,
            mismatch: ResumeMismatchPolicy::default(),
        }
    }
}

/// Decision between blaming the previous writer and blaming the current source.
///
/// When overlap bytes differ, either the data already on disk is wrong or the
/// peer is serving a different file. With probability `truncate_probability`
/// the trailing `truncate_window` bytes before the resume point are marked
/// empty again and the source retries; otherwise the source is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeMismatchPolicy {
    /// Probability in `[0, 1]` of truncating instead of rejecting
    pub truncate_probability: f64,

    /// Bytes before the resume point reset to empty on truncation
    pub truncate_window: u64,
}

impl Default for ResumeMismatchPolicy {
    fn default() -> Self {
        Self {
            truncate_probability: 0.5,
            truncate_window: 4096,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_running: 10,
            max_running_per_peer: 1,
            tick_interval_ms: 1000,
            retry_buckets: 64,
            min_request_spacing_secs: 5,
            name_lookup_interval_secs: 3600,
            vendor: "gosh".to_string(),
            listen_port: 6346,
            swarm_chunk_size: 512 * 1024,
            persist_interval_secs: default_persist_interval(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            buffers: BufferConfig::default(),
            resume: ResumeConfig::default(),
        }
    }
}

impl TransferConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TransferError::storage(
                crate::error::StorageErrorKind::Open,
                path,
                format!("Read config failed: {}", e),
            )
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the global running cap
    pub fn max_running(mut self, max: usize) -> Self {
        self.max_running = max;
        self
    }

    /// Set the per-peer running cap
    pub fn max_running_per_peer(mut self, max: usize) -> Self {
        self.max_running_per_peer = max;
        self
    }

    /// Set the resume overlap window
    pub fn overlap_size(mut self, bytes: u64) -> Self {
        self.resume.overlap_size = bytes;
        self
    }

    /// Set the resume mismatch policy
    pub fn mismatch_policy(mut self, policy: ResumeMismatchPolicy) -> Self {
        self.resume.mismatch = policy;
        self
    }

    /// Set the minimum spacing between requests to one peer
    pub fn min_request_spacing(mut self, secs: u64) -> Self {
        self.min_request_spacing_secs = secs;
        self
    }

    /// Set the swarmed chunk size
    pub fn swarm_chunk_size(mut self, bytes: u64) -> Self {
        self.swarm_chunk_size = bytes;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_running == 0 {
            return Err(TransferError::invalid_input(
                "max_running",
                "Must be at least 1",
            ));
        }

        if self.max_running_per_peer == 0 {
            return Err(TransferError::invalid_input(
                "max_running_per_peer",
                "Must be at least 1",
            ));
        }

        if !self.retry_buckets.is_power_of_two() {
            return Err(TransferError::invalid_input(
                "retry_buckets",
                "Must be a power of two",
            ));
        }

        if self.retry.min_delay > self.retry.max_delay {
            return Err(TransferError::invalid_input(
                "retry.min_delay",
                "Must not exceed retry.max_delay",
            ));
        }

        if self.retry.max_failures == 0 {
            return Err(TransferError::invalid_input(
                "retry.max_failures",
                "Must be at least 1",
            ));
        }

        let p = self.resume.mismatch.truncate_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(TransferError::invalid_input(
                "resume.mismatch.truncate_probability",
                "Must be within [0, 1]",
            ));
        }

        if self.buffers.chunk_size == 0 || self.buffers.max_chunks == 0 {
            return Err(TransferError::invalid_input(
                "buffers",
                "Chunk size and pool size must be non-zero",
            ));
        }

        if self.buffers.min_read > self.buffers.chunk_size {
            return Err(TransferError::invalid_input(
                "buffers.min_read",
                "Must not exceed buffers.chunk_size",
            ));
        }

        if self.tick_interval_ms == 0 || self.persist_interval_secs == 0 {
            return Err(TransferError::invalid_input(
                "tick_interval_ms",
                "Service intervals must be non-zero",
            ));
        }

        if self.swarm_chunk_size == 0 {
            return Err(TransferError::invalid_input(
                "swarm_chunk_size",
                "Must be non-zero",
            ));
        }

        Ok(())
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect)
    }

    pub(crate) fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.push_sent)
    }

    pub(crate) fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.headers)
    }

    pub(crate) fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.data_stall)
    }

    pub(crate) fn active_queue_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.active_queue)
    }

    pub(crate) fn request_spacing(&self) -> Duration {
        Duration::from_secs(self.min_request_spacing_secs)
    }
}
