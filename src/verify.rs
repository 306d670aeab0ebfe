//! Post-download hand-off
//!
//! Completed files are handed to a hash verifier and then to a mover. Both
//! run outside the transfer core and report back through the
//! `TransferManager::on_verify_*` and `on_move_*` callbacks.

use crate::error::Result;
use crate::types::FileId;
use std::path::Path;

/// Queues completed files for content-hash verification
pub trait HashVerification: Send {
    fn enqueue(&mut self, file: FileId, name: &str, expected_hash: Option<&str>) -> Result<()>;
}

/// Moves verified files to their final location
pub trait FileRelocation: Send {
    fn move_file(&mut self, file: FileId, name: &str, destination: &Path) -> Result<()>;
}
