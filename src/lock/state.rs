//! Lock lifecycle state machine
//!
//! Tracks the held lock, the owner thread, reentrancy depth, and pending
//! contention under one mutex. Invariants: an owner implies a held lock, at
//! most one owner at a time, and `contention_pending` is only ever set while
//! a lock is held.

use crate::errors::{Error, Result};
use crate::init::InitializationAction;
use crate::lock::{ContentionHandler, FileLock, FileLockManager, LockMode};
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, trace, warn};

/// Ownership relinquished for the duration of a long-running operation
pub(crate) struct SavedOwnership {
    depth: usize,
}

/// A held use-cache frame; releases one level of ownership on drop
pub(crate) struct UseCacheFrame<'a> {
    machine: &'a LockStateMachine,
}

impl Drop for UseCacheFrame<'_> {
    fn drop(&mut self) {
        self.machine.exit_use_cache();
    }
}

struct LockState {
    open: bool,
    lock: Option<Arc<dyn FileLock>>,
    owner: Option<ThreadId>,
    depth: usize,
    contention_pending: bool,
}

pub(crate) struct LockStateMachine {
    manager: Arc<dyn FileLockManager>,
    initializer: Arc<dyn InitializationAction>,
    lock_file: PathBuf,
    display_name: String,
    mode: LockMode,
    state: Mutex<LockState>,
    owner_freed: Condvar,
    contention: ContentionHandler,
}

impl LockStateMachine {
    pub fn new(
        manager: Arc<dyn FileLockManager>,
        initializer: Arc<dyn InitializationAction>,
        lock_file: PathBuf,
        display_name: String,
        mode: LockMode,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let contention: ContentionHandler = Arc::new(move || {
                if let Some(machine) = weak.upgrade() {
                    machine.on_contention();
                }
            });
            Self {
                manager,
                initializer,
                lock_file,
                display_name,
                mode,
                state: Mutex::new(LockState {
                    open: false,
                    lock: None,
                    owner: None,
                    depth: 0,
                    contention_pending: false,
                }),
                owner_freed: Condvar::new(),
                contention,
            }
        })
    }

    /// The handler the platform invokes to signal contention
    pub fn contention_handler(&self) -> ContentionHandler {
        Arc::clone(&self.contention)
    }

    pub fn open(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.open {
            return Err(Error::already_open(&self.display_name));
        }
        if matches!(self.mode, LockMode::Shared | LockMode::Exclusive) {
            state.lock = Some(self.acquire(self.mode)?);
        }
        state.open = true;
        debug!(cache = %self.display_name, mode = %self.mode, "cache opened");
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Ok(());
        }

        // Closing from inside the calling thread's own frame would deadlock
        // the wait below
        let current = thread::current().id();
        if state.owner == Some(current) {
            return Err(Error::cache_in_use(&self.display_name));
        }
        while state.owner.is_some() {
            self.owner_freed.wait(&mut state);
        }
        if !state.open {
            // Another thread finished the close while this one waited
            return Ok(());
        }

        state.open = false;
        state.contention_pending = false;
        let result = match state.lock.take() {
            Some(lock) => lock.close(),
            None => Ok(()),
        };
        // Parked waiters re-check `open` and bail out, even when the lock
        // failed to close
        self.owner_freed.notify_all();
        debug!(cache = %self.display_name, "cache closed");
        result
    }

    /// Establish ownership for the calling thread, acquiring the lock first
    /// when none is held. Blocks while another thread owns.
    pub fn enter_use_cache(&self, operation: &str) -> Result<()> {
        if self.mode == LockMode::Shared {
            return Err(Error::shared_mode(operation));
        }

        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::cache_closed("use the cache"));
        }

        let current = thread::current().id();
        if state.owner == Some(current) {
            state.depth += 1;
            return Ok(());
        }

        while state.owner.is_some() && state.open {
            self.owner_freed.wait(&mut state);
        }
        if !state.open {
            return Err(Error::cache_closed("use the cache"));
        }

        if state.lock.is_none() {
            state.lock = Some(self.acquire(LockMode::Exclusive)?);
        }
        state.owner = Some(current);
        state.depth = 1;
        trace!(cache = %self.display_name, operation, "ownership established");
        Ok(())
    }

    /// Establish ownership and return a frame that releases it on drop, so
    /// the owner slot is freed even when the caller's action panics.
    pub fn use_cache_frame(&self, operation: &str) -> Result<UseCacheFrame<'_>> {
        self.enter_use_cache(operation)?;
        Ok(UseCacheFrame { machine: self })
    }

    /// Release one level of ownership. The lock stays held unless contention
    /// arrived during the frame.
    pub fn exit_use_cache(&self) {
        let mut state = self.state.lock();
        let current = thread::current().id();
        if state.owner != Some(current) {
            warn!(cache = %self.display_name, "use-cache exit from a non-owner thread ignored");
            return;
        }

        state.depth -= 1;
        if state.depth > 0 {
            return;
        }

        state.owner = None;
        if state.contention_pending {
            debug!(cache = %self.display_name, "releasing lock to a waiting process");
            if let Some(lock) = state.lock.take() {
                Self::close_quietly(&self.display_name, &lock);
            }
            state.contention_pending = false;
        }
        self.owner_freed.notify_all();
    }

    /// Relinquish ownership for a long-running operation. Returns `None` when
    /// the calling thread is not the owner (top-level or reentrant call).
    pub fn enter_long_running(&self) -> Result<Option<SavedOwnership>> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(Error::cache_closed("start a long-running operation"));
        }

        if state.owner != Some(thread::current().id()) {
            return Ok(None);
        }

        let saved = SavedOwnership { depth: state.depth };
        state.owner = None;
        state.depth = 0;
        if state.contention_pending {
            debug!(cache = %self.display_name, "releasing lock to a waiting process");
            if let Some(lock) = state.lock.take() {
                Self::close_quietly(&self.display_name, &lock);
            }
            state.contention_pending = false;
        }
        self.owner_freed.notify_all();
        Ok(Some(saved))
    }

    /// Restore ownership after a long-running operation, reacquiring the lock
    /// if it was released to a waiting process.
    pub fn exit_long_running(&self, saved: SavedOwnership) -> Result<()> {
        let mut state = self.state.lock();
        while state.owner.is_some() && state.open {
            self.owner_freed.wait(&mut state);
        }
        if !state.open {
            return Err(Error::cache_closed("restore cache ownership"));
        }

        if state.lock.is_none() {
            state.lock = Some(self.acquire(LockMode::Exclusive)?);
        }
        state.owner = Some(thread::current().id());
        state.depth = saved.depth;
        Ok(())
    }

    /// Deliver a contention signal from the lock manager
    pub fn on_contention(&self) {
        let mut state = self.state.lock();
        if !state.open {
            trace!(cache = %self.display_name, "contention signal after close discarded");
            return;
        }
        if state.lock.is_none() {
            return;
        }
        if state.owner.is_none() {
            debug!(cache = %self.display_name, "another process wants the lock, releasing now");
            if let Some(lock) = state.lock.take() {
                Self::close_quietly(&self.display_name, &lock);
            }
        } else {
            debug!(cache = %self.display_name, "another process wants the lock, deferring release");
            state.contention_pending = true;
        }
    }

    /// Run `f` against the held lock iff the calling thread is the owner
    pub fn with_owned_lock<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&dyn FileLock) -> Result<R>,
    ) -> Result<R> {
        let lock = {
            let state = self.state.lock();
            if state.owner != Some(thread::current().id()) {
                return Err(Error::file_access_requires_lock(operation));
            }
            match &state.lock {
                Some(lock) => Arc::clone(lock),
                None => return Err(Error::file_access_requires_lock(operation)),
            }
        };
        // User actions run outside the state mutex so they may reenter
        f(lock.as_ref())
    }

    fn acquire(&self, mode: LockMode) -> Result<Arc<dyn FileLock>> {
        let lock: Arc<dyn FileLock> =
            Arc::from(self.manager.lock(&self.lock_file, mode, &self.display_name)?);
        let lock = self.handshake(lock)?;
        self.manager
            .allow_contention(lock.as_ref(), Arc::clone(&self.contention));
        Ok(lock)
    }

    /// The initialization handshake: ask the action whether the store needs
    /// building and, if so, build it inside the crash-safe write region of an
    /// exclusive lock, upgrading and downgrading around a shared request.
    fn handshake(&self, lock: Arc<dyn FileLock>) -> Result<Arc<dyn FileLock>> {
        let requires = self.close_on_error(
            &lock,
            self.initializer.requires_initialization(lock.as_ref()),
        )?;
        if !requires {
            return Ok(lock);
        }

        match lock.mode() {
            LockMode::Exclusive => {
                debug!(cache = %self.display_name, "initializing store");
                self.close_on_error(
                    &lock,
                    lock.write_file(&mut || self.initializer.initialize(lock.as_ref())),
                )?;
                Ok(lock)
            }
            LockMode::Shared => {
                // The store cannot be built under a shared lock; upgrade,
                // build, then downgrade so peers only ever see a finished store
                lock.close()?;
                let exclusive: Arc<dyn FileLock> = Arc::from(self.manager.lock(
                    &self.lock_file,
                    LockMode::Exclusive,
                    &self.display_name,
                )?);
                let still_required = self.close_on_error(
                    &exclusive,
                    self.initializer.requires_initialization(exclusive.as_ref()),
                )?;
                if still_required {
                    debug!(cache = %self.display_name, "initializing store");
                    self.close_on_error(
                        &exclusive,
                        exclusive.write_file(&mut || self.initializer.initialize(exclusive.as_ref())),
                    )?;
                }
                exclusive.close()?;

                let shared: Arc<dyn FileLock> = Arc::from(self.manager.lock(
                    &self.lock_file,
                    LockMode::Shared,
                    &self.display_name,
                )?);
                let requires = self.close_on_error(
                    &shared,
                    self.initializer.requires_initialization(shared.as_ref()),
                )?;
                if requires {
                    shared.close()?;
                    return Err(Error::initialization(
                        "store still requires initialization after an exclusive rebuild",
                    ));
                }
                Ok(shared)
            }
            LockMode::None => unreachable!("locks are never acquired in none mode"),
        }
    }

    fn close_on_error<T>(&self, lock: &Arc<dyn FileLock>, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            Self::close_quietly(&self.display_name, lock);
            e
        })
    }

    fn close_quietly(display_name: &str, lock: &Arc<dyn FileLock>) {
        if let Err(e) = lock.close() {
            warn!(cache = display_name, error = %e, "failed to release file lock");
        }
    }

    #[cfg(test)]
    pub(crate) fn holds_lock(&self) -> bool {
        self.state.lock().lock.is_some()
    }

    #[cfg(test)]
    pub(crate) fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }
}
