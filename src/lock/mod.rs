//! Inter-process file locking
//!
//! This module defines the lock contracts the coordinator consumes and a
//! default manager backed by OS advisory locks.

mod manager;
mod state;

pub use manager::{DefaultFileLockManager, OnDiskFileLock};
pub(crate) use state::{LockStateMachine, SavedOwnership};

use crate::errors::Result;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Callback registered with the lock manager, invoked when another process
/// wants the lock.
pub type ContentionHandler = Arc<dyn Fn() + Send + Sync>;

/// The kind of inter-process lock a coordinator holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple processes may hold the lock; cache operations are read-only
    Shared,
    /// A single process holds the lock for reading and writing
    Exclusive,
    /// No lock is held at open; an exclusive lock is acquired on demand
    None,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
            LockMode::None => "none",
        };
        write!(f, "{name}")
    }
}

/// A held inter-process lock on one file.
///
/// `write_file` runs its action inside a crash-safe region: an interrupted
/// action is observable to the next holder through `is_dirty`. `update_file`
/// runs the action under the lock without the crash marker. Both require an
/// exclusive lock; `read_file` works under any mode. Actions must not call
/// back into the same lock's file operations.
pub trait FileLock: Send + Sync {
    /// The mode this lock was acquired in
    fn mode(&self) -> LockMode;

    /// The file this lock protects
    fn lock_file(&self) -> &Path;

    /// Run a read-only action under the lock
    fn read_file(&self, action: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Run a mutating action under an exclusive lock
    fn update_file(&self, action: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Run a mutating action inside the crash-safe region
    fn write_file(&self, action: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Whether a previous holder left a `write_file` region unfinished
    fn is_dirty(&self) -> Result<bool> {
        Ok(false)
    }

    /// Release the lock
    fn close(&self) -> Result<()>;
}

/// Produces file locks and wires up contention callbacks.
pub trait FileLockManager: Send + Sync {
    /// Acquire a lock on `lock_file` in the given mode, blocking until it is
    /// available or the manager gives up
    fn lock(
        &self,
        lock_file: &Path,
        mode: LockMode,
        display_name: &str,
    ) -> Result<Box<dyn FileLock>>;

    /// Register the handler to invoke when another process wants `lock`
    fn allow_contention(&self, lock: &dyn FileLock, handler: ContentionHandler);
}
