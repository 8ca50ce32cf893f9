//! File access façade
//!
//! Exposes the held lock's file operations to the current owner thread.
//! Every call is checked: off the owner thread, or with no lock held, the
//! operation fails before touching the lock.

use crate::errors::Result;
use crate::lock::LockStateMachine;
use std::sync::Arc;

/// Owner-checked view over the coordinator's held file lock
#[derive(Clone)]
pub struct FileAccess {
    machine: Arc<LockStateMachine>,
}

impl FileAccess {
    pub(crate) fn new(machine: Arc<LockStateMachine>) -> Self {
        Self { machine }
    }

    /// Run a read-only action under the held lock
    pub fn read_file(&self, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.machine
            .with_owned_lock("read_file", |lock| lock.read_file(action))
    }

    /// Run a mutating action under the held lock
    pub fn update_file(&self, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.machine
            .with_owned_lock("update_file", |lock| lock.update_file(action))
    }

    /// Run a mutating action inside the lock's crash-safe region
    pub fn write_file(&self, action: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.machine
            .with_owned_lock("write_file", |lock| lock.write_file(action))
    }
}
